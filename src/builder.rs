use crate::{
    config::Config,
    id::{InfoHash, NodeId},
    routing::node::RoutingNode,
    time::{Clock, TokioClock},
    worker::{DhtHandler, HealthError, HealthResult, OneshotTask, Socket, SocketTransport, Stats},
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task,
};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Maintains a Mainline DHT routing table and estimates swarm sizes through BEP33 scrapes.
///
/// This type is cheaply cloneable where each clone refers to the same underlying DHT instance. The
/// event loop stops when `shutdown` is called or when the last clone is dropped.
#[derive(Clone)]
pub struct SwarmDht {
    send: mpsc::Sender<OneshotTask>,
}

impl SwarmDht {
    /// Create a new DhtBuilder.
    pub fn builder() -> DhtBuilder {
        DhtBuilder {
            config: Config::default(),
            nodes: Vec::new(),
            node_id: None,
            clock: None,
        }
    }

    fn with_builder(builder: DhtBuilder, socket: Socket) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let clock = builder
            .clock
            .unwrap_or_else(|| Arc::new(TokioClock) as Arc<dyn Clock>);

        let mut config = builder.config;
        // The self bucket must have room for the local node.
        config.bucket_size = config.bucket_size.max(1);

        let handler = DhtHandler::new(
            builder.node_id.unwrap_or_else(rand::random),
            config,
            clock,
            socket,
            command_rx,
        );

        if !builder.nodes.is_empty()
            && command_tx
                .try_send(OneshotTask::Bootstrap(builder.nodes))
                .is_err()
        {
            // The channel was just created and the receiver lives inside `handler`.
            unreachable!()
        }

        task::spawn(handler.run());

        Self { send: command_tx }
    }

    /// Add seeds and (re)enter bootstrap mode. Seeds are only queried, never inserted into the
    /// routing table.
    pub async fn bootstrap<I>(&self, seeds: I) -> Result<(), HealthError>
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        self.send
            .send(OneshotTask::Bootstrap(seeds.into_iter().collect()))
            .await
            .map_err(|_| HealthError::Cancelled)
    }

    /// Estimate the number of seeders and leechers of a torrent.
    ///
    /// Results are cached for `Config::cache_ttl`; concurrent calls for the same infohash share a
    /// single lookup (and the deadline of the first one). `None` uses `Config::lookup_timeout`.
    ///
    /// A lookup that collects no Bloom filter before its deadline yields zero counts. The only
    /// error is `Cancelled`, returned when the DHT shuts down.
    pub async fn check_health(
        &self,
        info_hash: InfoHash,
        timeout: impl Into<Option<Duration>>,
    ) -> Result<HealthResult, HealthError> {
        let (tx, rx) = oneshot::channel();

        self.send
            .send(OneshotTask::CheckHealth {
                info_hash,
                timeout: timeout.into(),
                tx,
            })
            .await
            .map_err(|_| HealthError::Cancelled)?;

        rx.await.unwrap_or(Err(HealthError::Cancelled))
    }

    /// Snapshot of up to `k` nodes of the routing table closest to `target`, nearest first.
    pub async fn closest_nodes(
        &self,
        target: NodeId,
        k: u8,
    ) -> Result<Vec<RoutingNode>, HealthError> {
        let (tx, rx) = oneshot::channel();

        self.send
            .send(OneshotTask::ClosestNodes {
                target,
                k: k as usize,
                tx,
            })
            .await
            .map_err(|_| HealthError::Cancelled)?;

        rx.await.map_err(|_| HealthError::Cancelled)
    }

    pub async fn stats(&self) -> Result<Stats, HealthError> {
        let (tx, rx) = oneshot::channel();

        self.send
            .send(OneshotTask::GetStats(tx))
            .await
            .map_err(|_| HealthError::Cancelled)?;

        rx.await.map_err(|_| HealthError::Cancelled)
    }

    /// Get the local address this DHT instance is bound to
    pub async fn local_addr(&self) -> io::Result<SocketAddr> {
        let (tx, rx) = oneshot::channel();

        fn error() -> io::Error {
            io::Error::new(io::ErrorKind::Other, "DhtHandler has shut down")
        }

        self.send
            .send(OneshotTask::GetLocalAddr(tx))
            .await
            .map_err(|_| error())?;

        rx.await.map_err(|_| error())
    }

    /// Stop the event loop. Pending `check_health` calls complete with `Cancelled`.
    pub async fn shutdown(&self) {
        self.send.send(OneshotTask::Shutdown).await.unwrap_or(())
    }
}

// ----------------------------------------------------------------------------//

/// Stores information for initializing a DHT.
pub struct DhtBuilder {
    config: Config,
    nodes: Vec<SocketAddr>,
    node_id: Option<NodeId>,
    clock: Option<Arc<dyn Clock>>,
}

impl DhtBuilder {
    /// Add a seed to bootstrap from as soon as the DHT starts.
    pub fn add_node(mut self, node_addr: SocketAddr) -> DhtBuilder {
        if !self.nodes.contains(&node_addr) {
            self.nodes.push(node_addr);
        }
        self
    }

    /// Add a router which seeds every health lookup.
    ///
    /// Routers are resolved once, when the DHT starts. Unlike nodes, they never enter the routing
    /// table.
    pub fn add_router(mut self, router: String) -> DhtBuilder {
        if !self.config.routers.contains(&router) {
            self.config.routers.push(router);
        }
        self
    }

    /// Add routers. Same as calling `add_router` multiple times but more convenient in some cases.
    pub fn add_routers<I, T>(mut self, routers: I) -> DhtBuilder
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for router in routers {
            self = self.add_router(router.into());
        }
        self
    }

    /// Replace the routers, the defaults included. An empty list disables router seeding.
    pub fn set_routers<I, T>(mut self, routers: I) -> DhtBuilder
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.config.routers.clear();
        self.add_routers(routers)
    }

    /// Set the id of this node. If not provided, a random node id is generated.
    pub fn set_node_id(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    /// Replace the whole configuration. Routers set earlier are replaced as well.
    pub fn set_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Capacity of every bucket. Raised to 1 if zero.
    pub fn set_bucket_size(mut self, bucket_size: usize) -> Self {
        self.config.bucket_size = bucket_size.max(1);
        self
    }

    pub fn set_max_timeouts(mut self, max_timeouts: u32) -> Self {
        self.config.max_timeouts = max_timeouts;
        self
    }

    pub fn set_refresh_period(mut self, period: Duration) -> Self {
        self.config.refresh_period = period;
        self
    }

    pub fn set_quarantine_period(mut self, period: Duration) -> Self {
        self.config.quarantine_period = period;
        self
    }

    /// Bootstrap stops once the routing table holds this many nodes, the local one included.
    pub fn set_min_bootstrap_nodes(mut self, count: usize) -> Self {
        self.config.min_bootstrap_nodes = count;
        self
    }

    pub fn set_bootstrap_delay(mut self, delay: Duration) -> Self {
        self.config.bootstrap_delay = delay;
        self
    }

    pub fn set_max_concurrent_refresh_msgs(mut self, count: usize) -> Self {
        self.config.max_concurrent_refresh_msgs = count;
        self
    }

    pub fn set_max_nodes_per_lookup(mut self, count: usize) -> Self {
        self.config.max_nodes_per_lookup = count;
        self
    }

    pub fn set_max_responses(mut self, count: u32) -> Self {
        self.config.max_responses = count;
        self
    }

    /// Default deadline of `check_health`.
    pub fn set_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.config.lookup_timeout = timeout;
        self
    }

    pub fn set_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Largest datagram that will be sent. Bigger messages are dropped.
    pub fn set_mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    pub fn set_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn set_fanout_interval(mut self, interval: Duration) -> Self {
        self.config.fanout_interval = interval;
        self
    }

    /// Set the `v` key sent in every message. Peers whose version starts with `NS` are given
    /// priority during refresh.
    pub fn set_client_version<V: Into<Vec<u8>>>(mut self, version: V) -> Self {
        self.config.client_version = version.into();
        self
    }

    /// Override the source of timestamps. Defaults to the tokio clock.
    ///
    /// Timers are armed against this clock, so it has to advance at the pace of tokio time. Its
    /// origin may differ.
    pub fn set_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Start the DHT with the current configuration and bind it to the provided socket.
    /// Fails only if `socket.local_addr()` fails.
    pub fn start<S: SocketTransport>(self, socket: S) -> io::Result<SwarmDht> {
        let socket = Socket::new(socket, self.config.mtu)?;
        Ok(SwarmDht::with_builder(self, socket))
    }
}
