use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Duration;

use crate::id::NodeId;
use crate::time::Instant;
use crate::worker::timer::Timeout;

/// Node id + its socket address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeHandle {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeHandle {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// Someone we can send a request to.
///
/// Bootstrap seeds are contacted before we learn their id, so they never enter a bucket.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Contact {
    Node(NodeHandle),
    Seed(SocketAddr),
}

impl Contact {
    pub fn addr(&self) -> SocketAddr {
        match self {
            Self::Node(node) => node.addr,
            Self::Seed(addr) => *addr,
        }
    }

    pub fn id(&self) -> Option<NodeId> {
        match self {
            Self::Node(node) => Some(node.id),
            Self::Seed(_) => None,
        }
    }
}

impl From<NodeHandle> for Contact {
    fn from(node: NodeHandle) -> Self {
        Self::Node(node)
    }
}

/// Node participating in the dht, as tracked by the routing table.
#[derive(Clone)]
pub struct RoutingNode {
    handle: NodeHandle,
    last_seen: Instant,
    rtt: Option<Duration>,
    consecutive_timeouts: u32,
    in_quarantine: bool,
    is_ns: bool,
    refresh_task: Option<Timeout>,
}

impl RoutingNode {
    /// Create a node that has just been inserted and has not yet confirmed its liveness.
    pub fn new(handle: NodeHandle, now: Instant) -> Self {
        Self {
            handle,
            last_seen: now,
            rtt: None,
            consecutive_timeouts: 0,
            in_quarantine: true,
            is_ns: false,
            refresh_task: None,
        }
    }

    /// Create the entry for the local node.
    pub(crate) fn local(handle: NodeHandle, now: Instant) -> Self {
        Self {
            in_quarantine: false,
            ..Self::new(handle, now)
        }
    }

    #[cfg(test)]
    pub(crate) fn with_rtt(mut self, rtt: Option<Duration>) -> Self {
        self.rtt = rtt;
        self
    }

    pub fn id(&self) -> NodeId {
        self.handle.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn in_quarantine(&self) -> bool {
        self.in_quarantine
    }

    pub fn is_ns(&self) -> bool {
        self.is_ns
    }

    pub(crate) fn refresh_task(&self) -> Option<Timeout> {
        self.refresh_task
    }

    /// Record that the node sent us a query.
    pub(crate) fn remote_query(&mut self, now: Instant) {
        self.last_seen = now;
        self.consecutive_timeouts = 0;
    }

    /// Record that the node answered one of our requests.
    pub(crate) fn remote_response(&mut self, now: Instant, rtt: Option<Duration>, is_ns: bool) {
        self.last_seen = now;
        self.consecutive_timeouts = 0;
        self.in_quarantine = false;
        self.is_ns |= is_ns;

        if rtt.is_some() {
            self.rtt = rtt;
        }
    }

    /// Record that one of our requests to the node timed out. Returns the new timeout count.
    pub(crate) fn local_timeout(&mut self) -> u32 {
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        self.consecutive_timeouts
    }

    /// Replace the armed refresh task, returning the previous one so that it can be cancelled.
    pub(crate) fn replace_refresh_task(&mut self, task: Option<Timeout>) -> Option<Timeout> {
        std::mem::replace(&mut self.refresh_task, task)
    }
}

impl Eq for RoutingNode {}

impl PartialEq<RoutingNode> for RoutingNode {
    fn eq(&self, other: &RoutingNode) -> bool {
        self.handle == other.handle
    }
}

impl Hash for RoutingNode {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.handle.hash(state);
    }
}

impl Debug for RoutingNode {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("RoutingNode")
            .field("id", &self.handle.id)
            .field("addr", &self.handle.addr)
            .field("last_seen", &self.last_seen)
            .field("rtt", &self.rtt)
            .field("consecutive_timeouts", &self.consecutive_timeouts)
            .field("in_quarantine", &self.in_quarantine)
            .field("is_ns", &self.is_ns)
            .finish()
    }
}
