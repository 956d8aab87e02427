pub(crate) use self::{handler::DhtHandler, socket::Socket};
pub use self::{lookup::HealthResult, socket::SocketTransport};
use crate::{
    id::{InfoHash, NodeId},
    routing::{manager::Mode, node::RoutingNode},
    transaction::TransactionId,
};
use std::{collections::HashSet, net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::sync::oneshot;

mod handler;
mod lookup;
mod socket;
pub(crate) mod timer;

/// Snapshot of the routing table size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Stats {
    /// Entries in the main table, the local node included.
    pub main_size: usize,
    pub replacement_size: usize,
    pub mode: Mode,
}

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum HealthError {
    #[error("operation cancelled")]
    Cancelled,
}

/// Task that our DHT will execute immediately.
pub(crate) enum OneshotTask {
    /// Add seeds and (re)start bootstrapping.
    Bootstrap(Vec<SocketAddr>),
    /// Estimate the swarm size of an infohash.
    CheckHealth {
        info_hash: InfoHash,
        timeout: Option<Duration>,
        tx: oneshot::Sender<Result<HealthResult, HealthError>>,
    },
    /// Snapshot of the nodes closest to a target.
    ClosestNodes {
        target: NodeId,
        k: usize,
        tx: oneshot::Sender<Vec<RoutingNode>>,
    },
    GetStats(oneshot::Sender<Stats>),
    /// Get the local address the socket is bound to.
    GetLocalAddr(oneshot::Sender<SocketAddr>),
    Shutdown,
}

/// Task that our DHT will execute some time later.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ScheduledTask {
    /// A request went unanswered.
    RequestTimeout(TransactionId),
    /// Periodic refresh of a routing table node.
    RefreshNode(NodeId),
    /// Next round of the bootstrap.
    BootstrapStep,
    /// Send the next queued `get_peers` of a lookup.
    LookupFanout(InfoHash),
    /// A lookup ran out of time.
    LookupDeadline(InfoHash),
}

/// Resolve router host names, keeping the IPv4 results.
pub(crate) async fn resolve(routers: &[String]) -> Vec<SocketAddr> {
    let lookups = routers
        .iter()
        .map(|router| tokio::net::lookup_host(router.as_str()));

    let addrs: HashSet<_> = futures_util::future::join_all(lookups)
        .await
        .into_iter()
        .filter_map(|result| result.ok())
        .flatten()
        .filter(|addr| addr.is_ipv4())
        .collect();

    addrs.into_iter().collect()
}
