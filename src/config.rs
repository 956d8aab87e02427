use crate::router;
use std::time::Duration;

/// Client version prefix identifying "NS" peers.
pub const NS_VERSION_PREFIX: &[u8] = b"NS";

/// Tunables of the routing table, the RPC layer and health lookups.
///
/// Passed by value to the event loop at construction time; nothing here is global.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of every bucket (`K`).
    pub bucket_size: usize,
    /// Consecutive timeouts a node may accumulate before it is considered dead.
    pub max_timeouts: u32,
    /// Refresh period of a confirmed node.
    pub refresh_period: Duration,
    /// Refresh period of a node that has not yet answered since it was inserted.
    pub quarantine_period: Duration,
    /// Bootstrap stops once `main` holds this many nodes (self included).
    pub min_bootstrap_nodes: usize,
    /// Delay between two bootstrap steps.
    pub bootstrap_delay: Duration,
    /// Maximum number of outstanding maintenance probes.
    pub max_concurrent_refresh_msgs: usize,
    /// Maximum number of discovered nodes a single health lookup may query.
    pub max_nodes_per_lookup: usize,
    /// A health lookup finalizes early after this many Bloom-filter responses.
    pub max_responses: u32,
    /// Default deadline of a health lookup.
    pub lookup_timeout: Duration,
    /// How long a health result is served from cache.
    pub cache_ttl: Duration,
    /// Largest datagram the core will send.
    pub mtu: usize,
    /// Deadline of a single request.
    pub request_timeout: Duration,
    /// Pause between two `get_peers` of the lookup fan-out.
    pub fanout_interval: Duration,
    /// Routers that seed health lookups (`host:port`).
    pub routers: Vec<String>,
    /// Value of the `v` key of every outgoing message.
    pub client_version: Vec<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_size: 8,
            max_timeouts: 3,
            refresh_period: Duration::from_secs(10 * 60),
            quarantine_period: Duration::from_secs(3 * 60),
            min_bootstrap_nodes: 50,
            bootstrap_delay: Duration::from_secs(1),
            max_concurrent_refresh_msgs: 20,
            max_nodes_per_lookup: 1000,
            max_responses: 100,
            lookup_timeout: Duration::from_secs(15),
            cache_ttl: Duration::from_secs(30),
            mtu: 1200,
            request_timeout: Duration::from_secs(2),
            fanout_interval: Duration::from_millis(10),
            routers: router::DEFAULT_ROUTERS
                .iter()
                .map(|router| router.to_string())
                .collect(),
            client_version: b"SD\x00\x01".to_vec(),
        }
    }
}
