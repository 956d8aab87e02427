//! Transaction ids and the requests waiting for an answer.

use crate::{
    id::{InfoHash, NodeId},
    routing::node::Contact,
    time::Instant,
    worker::{
        timer::{Scheduler, Timeout},
        ScheduledTask,
    },
};
use std::{collections::HashMap, convert::TryInto, io, net::SocketAddr, time::Duration};
use thiserror::Error;

pub(crate) const TRANSACTION_ID_LEN: usize = 2;

#[derive(Error, Debug)]
pub(crate) enum RpcError {
    #[error("failed to encode message")]
    Encode(#[source] serde_bencode::Error),
    #[error("failed to decode message")]
    Decode(#[source] serde_bencode::Error),
    #[error("message of {len} bytes exceeds the mtu of {mtu} bytes")]
    TooLarge { len: usize, mtu: usize },
    #[error("socket error")]
    Io(#[from] io::Error),
}

/// Two byte transaction id echoed back in the `t` key of a response.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct TransactionId(u16);

impl TransactionId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; TRANSACTION_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(u16::from_be_bytes(bytes)))
    }

    pub fn to_bytes(self) -> [u8; TRANSACTION_ID_LEN] {
        self.0.to_be_bytes()
    }
}

/// What a request was sent for.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Purpose {
    /// Confirm a node that queried us before taking it in.
    Ping,
    /// Probe a node discovered in a `nodes` list.
    Probe,
    /// Periodic liveness check of a known node.
    Refresh,
    /// `find_node` for ourselves sent to a bootstrap seed.
    Bootstrap,
    /// `get_peers` of a health lookup.
    Lookup(InfoHash),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Query {
    Ping,
    FindNode(NodeId),
    /// `get_peers` with the BEP33 `scrape` and `noseed` flags set.
    GetPeers(InfoHash),
}

/// A request one of the state machines wants sent.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct OutgoingQuery {
    pub contact: Contact,
    pub query: Query,
    pub purpose: Purpose,
}

impl OutgoingQuery {
    pub fn new(contact: Contact, query: Query, purpose: Purpose) -> Self {
        Self {
            contact,
            query,
            purpose,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PendingRequest {
    pub contact: Contact,
    pub purpose: Purpose,
    pub sent_at: Instant,
    timeout: Timeout,
}

/// Table of requests in flight, keyed by transaction id.
pub(crate) struct Transactions {
    pending: HashMap<TransactionId, PendingRequest>,
}

impl Transactions {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Allocate a fresh id for a request and arm its timeout. Returns `None` when every id is
    /// already in use.
    pub fn start<S: Scheduler<ScheduledTask>>(
        &mut self,
        contact: Contact,
        purpose: Purpose,
        now: Instant,
        request_timeout: Duration,
        scheduler: &mut S,
    ) -> Option<TransactionId> {
        if self.pending.len() > u16::MAX as usize {
            return None;
        }

        let id = loop {
            let id = TransactionId(rand::random());
            if !self.pending.contains_key(&id) {
                break id;
            }
        };

        let timeout = scheduler.schedule_in(request_timeout, ScheduledTask::RequestTimeout(id));

        self.pending.insert(
            id,
            PendingRequest {
                contact,
                purpose,
                sent_at: now,
                timeout,
            },
        );

        Some(id)
    }

    /// Settle the request answered by `from`. A reply from an address other than the one the
    /// request went to does not match and leaves the request pending.
    pub fn complete<S: Scheduler<ScheduledTask>>(
        &mut self,
        id: TransactionId,
        from: SocketAddr,
        scheduler: &mut S,
    ) -> Option<PendingRequest> {
        match self.pending.get(&id) {
            Some(request) if request.contact.addr() == from => (),
            _ => return None,
        }

        let request = self.pending.remove(&id)?;
        scheduler.cancel(request.timeout);

        Some(request)
    }

    /// Drop a request that could not be sent.
    pub fn abort<S: Scheduler<ScheduledTask>>(
        &mut self,
        id: TransactionId,
        scheduler: &mut S,
    ) -> Option<PendingRequest> {
        let request = self.pending.remove(&id)?;
        scheduler.cancel(request.timeout);
        Some(request)
    }

    /// The timeout of the request fired. Returns the request the first time only.
    pub fn expire(&mut self, id: TransactionId) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    pub fn clear(&mut self) {
        self.pending.clear()
    }
}
