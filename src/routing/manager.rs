use super::{
    node::{Contact, NodeHandle, RoutingNode},
    table::RoutingTable,
};
use crate::{
    config::Config,
    id::{generate_close_id, NodeId},
    time::Instant,
    transaction::{OutgoingQuery, Purpose, Query},
    worker::{
        timer::{Scheduler, Timeout},
        ScheduledTask, Stats,
    },
};
use rand::Rng;
use std::{collections::HashSet, net::SocketAddr, time::Duration};

/// Whether the routing table is still being filled from bootstrap seeds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Bootstrap,
    Normal,
}

/// Applies the routing policy to query, response and timeout events.
///
/// Requests the manager wants sent are returned as `OutgoingQuery` values, delayed work is
/// handed to the `Scheduler` passed to each call.
pub(crate) struct RoutingManager {
    config: Config,
    table: RoutingTable,
    mode: Mode,
    seeds: Vec<SocketAddr>,
    bootstrap_task: Option<Timeout>,
    // Addresses of discovered nodes with an outstanding probe.
    probing: HashSet<SocketAddr>,
}

impl RoutingManager {
    pub fn new(local: NodeHandle, config: Config, now: Instant) -> Self {
        let table = RoutingTable::new(local, config.bucket_size, now);

        Self {
            config,
            table,
            mode: Mode::Bootstrap,
            seeds: Vec::new(),
            bootstrap_task: None,
            probing: HashSet::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.table.node_id()
    }

    #[cfg(test)]
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    #[cfg(test)]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Up to `k` nodes closest to `target`, the local node excluded.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<RoutingNode> {
        self.table.closest(target, k, true)
    }

    /// A node sent us a query.
    pub fn on_query_received<S: Scheduler<ScheduledTask>>(
        &mut self,
        sender: NodeHandle,
        now: Instant,
        scheduler: &mut S,
    ) -> Vec<OutgoingQuery> {
        if sender.id == self.table.node_id() {
            return Vec::new();
        }

        if let Ok(node) = self.table.get_main_mut(&sender.id) {
            node.remote_query(now);
            let delay = refresh_delay(&self.config, node);
            arm_refresh(node, delay, scheduler);
            return Vec::new();
        }

        let in_replacement = if let Ok(node) = self.table.get_replacement_mut(&sender.id) {
            node.remote_query(now);
            true
        } else {
            false
        };

        // Reachability is only confirmed by a response, so the node is taken in once it
        // answers the ping.
        if self.table.has_room_main(&sender.id) {
            return vec![OutgoingQuery::new(
                sender.into(),
                Query::Ping,
                Purpose::Ping,
            )];
        }

        if !in_replacement {
            self.insert_replacement(RoutingNode::new(sender, now), false, scheduler);
        }

        Vec::new()
    }

    /// A node answered one of our requests.
    pub fn on_response_received<S: Scheduler<ScheduledTask>>(
        &mut self,
        responder: NodeHandle,
        rtt: Option<Duration>,
        is_ns: bool,
        now: Instant,
        scheduler: &mut S,
    ) {
        let id = responder.id;

        if id == self.table.node_id() {
            return;
        }

        if let Ok(node) = self.table.get_main_mut(&id) {
            node.remote_response(now, rtt, is_ns);
            let delay = refresh_delay(&self.config, node);
            arm_refresh(node, delay, scheduler);
            return;
        }

        if let Ok(node) = self.table.get_replacement_mut(&id) {
            node.remote_response(now, rtt, is_ns);
            let delay = refresh_delay(&self.config, node);
            arm_refresh(node, delay, scheduler);

            if self.table.has_room_main(&id) {
                if let Ok(node) = self.table.remove(&id) {
                    log::debug!("Promoting {:?} from the replacement table", node.handle());
                    self.insert_main(node, scheduler);
                }
            }

            return;
        }

        let index = self.table.bucket_index(&id);
        let mut node = RoutingNode::new(responder, now);
        node.remote_response(now, rtt, is_ns);

        if self.table.has_room_main(&id) && self.table.replacement_bucket(index).is_empty() {
            self.insert_main(node, scheduler);
        } else {
            self.insert_replacement(node, false, scheduler);
        }
    }

    /// A request sent to `contact` went unanswered.
    ///
    /// # Panics
    ///
    /// Panics if `contact` is the local node.
    pub fn on_timeout<S: Scheduler<ScheduledTask>>(
        &mut self,
        contact: Contact,
        scheduler: &mut S,
    ) -> Vec<OutgoingQuery> {
        let id = match contact {
            Contact::Node(node) => node.id,
            Contact::Seed(_) => return Vec::new(),
        };

        assert_ne!(id, self.table.node_id(), "request to the local node timed out");

        if let Ok(node) = self.table.get_main_mut(&id) {
            if node.local_timeout() <= self.config.max_timeouts {
                return Vec::new();
            }

            let node = match self.table.remove(&id) {
                Ok(node) => node,
                Err(_) => return Vec::new(),
            };

            log::debug!(
                "Removing {:?} from main after {} timeouts",
                node.handle(),
                node.consecutive_timeouts()
            );

            let index = self.table.bucket_index(&id);
            let queries = self.refresh_replacement_bucket(index, scheduler);

            self.insert_replacement(node, true, scheduler);

            return queries;
        }

        if let Ok(node) = self.table.get_replacement_mut(&id) {
            node.local_timeout();
        }

        Vec::new()
    }

    /// Nodes learned from a `nodes` list. Each entry carries whether the node that told us
    /// about it is an NS node; those are probed first.
    pub fn on_nodes_found(&mut self, nodes: &[(NodeHandle, bool)]) -> Vec<OutgoingQuery> {
        let mut nodes = nodes.to_vec();
        nodes.sort_by_key(|(_, is_ns)| !is_ns);

        let local_id = self.table.node_id();
        let mut queries = Vec::new();

        for (node, _) in nodes {
            if self.probing.len() >= self.config.max_concurrent_refresh_msgs {
                log::trace!("Probe budget exhausted, skipping remaining nodes");
                break;
            }

            if node.id == local_id
                || self.table.get_main(&node.id).is_ok()
                || self.table.get_replacement(&node.id).is_ok()
                || !self.table.has_room_main(&node.id)
            {
                continue;
            }

            if !self.probing.insert(node.addr) {
                continue;
            }

            queries.push(OutgoingQuery::new(
                node.into(),
                Query::FindNode(local_id),
                Purpose::Probe,
            ));
        }

        queries
    }

    /// A probe sent by `on_nodes_found` was answered or timed out.
    pub fn probe_finished(&mut self, addr: SocketAddr) {
        self.probing.remove(&addr);
    }

    /// The refresh task of a node fired.
    pub fn on_refresh_due<S: Scheduler<ScheduledTask>>(
        &mut self,
        id: NodeId,
        scheduler: &mut S,
    ) -> Vec<OutgoingQuery> {
        let local_id = self.table.node_id();

        let node = if self.table.get_main(&id).is_ok() {
            self.table.get_main_mut(&id)
        } else {
            self.table.get_replacement_mut(&id)
        };

        let node = match node {
            Ok(node) => node,
            Err(_) => return Vec::new(),
        };

        let delay = refresh_delay(&self.config, node);
        arm_refresh(node, delay, scheduler);

        let target = generate_close_id(local_id, local_id.log_distance(&id));

        vec![OutgoingQuery::new(
            (*node.handle()).into(),
            Query::FindNode(target),
            Purpose::Refresh,
        )]
    }

    /// Start (or restart) bootstrapping from the given seeds.
    pub fn do_bootstrap<S, I>(&mut self, seeds: I, scheduler: &mut S) -> Vec<OutgoingQuery>
    where
        S: Scheduler<ScheduledTask>,
        I: IntoIterator<Item = SocketAddr>,
    {
        for seed in seeds {
            if !self.seeds.contains(&seed) {
                self.seeds.push(seed);
            }
        }

        if let Some(task) = self.bootstrap_task.take() {
            scheduler.cancel(task);
        }

        if self.mode != Mode::Bootstrap {
            log::info!("Entering bootstrap mode");
            self.mode = Mode::Bootstrap;
        }

        self.bootstrap_step(scheduler)
    }

    /// Query the next random seed, or leave bootstrap mode when done.
    pub fn bootstrap_step<S: Scheduler<ScheduledTask>>(
        &mut self,
        scheduler: &mut S,
    ) -> Vec<OutgoingQuery> {
        self.bootstrap_task = None;

        if self.mode != Mode::Bootstrap {
            return Vec::new();
        }

        if self.table.num_rnodes() >= self.config.min_bootstrap_nodes || self.seeds.is_empty() {
            self.finish_bootstrap(scheduler);
            return Vec::new();
        }

        let seed = self
            .seeds
            .swap_remove(rand::thread_rng().gen_range(0..self.seeds.len()));

        self.bootstrap_task = Some(
            scheduler.schedule_in(self.config.bootstrap_delay, ScheduledTask::BootstrapStep),
        );

        log::debug!("Bootstrapping from {}", seed);

        vec![OutgoingQuery::new(
            Contact::Seed(seed),
            Query::FindNode(self.table.node_id()),
            Purpose::Bootstrap,
        )]
    }

    fn finish_bootstrap<S: Scheduler<ScheduledTask>>(&mut self, scheduler: &mut S) {
        if let Some(task) = self.bootstrap_task.take() {
            scheduler.cancel(task);
        }

        self.mode = Mode::Normal;

        log::info!(
            "Bootstrap finished with {} nodes in the routing table",
            self.table.num_rnodes()
        );
    }

    fn insert_main<S: Scheduler<ScheduledTask>>(&mut self, node: RoutingNode, scheduler: &mut S) {
        match self.table.insert_main(node) {
            Ok(node) => {
                let delay = refresh_delay(&self.config, node);
                arm_refresh(node, delay, scheduler);
            }
            Err(error) => {
                log::debug!("Failed to insert into main: {}", error);
                return;
            }
        }

        if self.mode == Mode::Bootstrap
            && self.table.num_rnodes() >= self.config.min_bootstrap_nodes
        {
            self.finish_bootstrap(scheduler);
        }
    }

    /// Insert into the replacement table. When the bucket is full its worst entry is evicted,
    /// unconditionally if `force` is set, otherwise only if it exceeded `max_timeouts`.
    fn insert_replacement<S: Scheduler<ScheduledTask>>(
        &mut self,
        mut node: RoutingNode,
        force: bool,
        scheduler: &mut S,
    ) -> bool {
        disarm_refresh(&mut node, scheduler);

        let index = self.table.bucket_index(&node.id());
        let bucket = self.table.replacement_bucket(index);

        if !bucket.has_room(0) {
            let worst = match bucket.worst() {
                Some(worst)
                    if force || worst.consecutive_timeouts() > self.config.max_timeouts =>
                {
                    worst.id()
                }
                _ => return false,
            };

            if let Ok(mut evicted) = self.table.remove(&worst) {
                log::debug!(
                    "Evicting {:?} from replacement bucket {}",
                    evicted.handle(),
                    index
                );
                disarm_refresh(&mut evicted, scheduler);
            }
        }

        match self.table.insert_replacement(node) {
            Ok(node) => {
                let delay = refresh_delay(&self.config, node);
                arm_refresh(node, delay, scheduler);
                true
            }
            Err(error) => {
                log::debug!("Failed to insert into replacement: {}", error);
                false
            }
        }
    }

    /// Ping the NS members of a replacement bucket now, spread refreshes of the others.
    fn refresh_replacement_bucket<S: Scheduler<ScheduledTask>>(
        &mut self,
        index: usize,
        scheduler: &mut S,
    ) -> Vec<OutgoingQuery> {
        let max_delay = self.config.quarantine_period.as_millis() as u64;
        let mut rng = rand::thread_rng();
        let mut queries = Vec::new();

        for node in self.table.replacement_bucket_mut(index).iter_mut() {
            if node.is_ns() {
                queries.push(OutgoingQuery::new(
                    (*node.handle()).into(),
                    Query::Ping,
                    Purpose::Refresh,
                ));
            } else {
                let delay = Duration::from_millis(rng.gen_range(0..=max_delay));
                arm_refresh(node, delay, scheduler);
            }
        }

        queries
    }

    pub fn stats(&self) -> Stats {
        Stats {
            main_size: self.table.num_rnodes(),
            replacement_size: self.table.num_replacements(),
            mode: self.mode,
        }
    }
}

fn refresh_delay(config: &Config, node: &RoutingNode) -> Duration {
    if node.in_quarantine() {
        config.quarantine_period
    } else {
        config.refresh_period
    }
}

fn arm_refresh<S: Scheduler<ScheduledTask>>(
    node: &mut RoutingNode,
    delay: Duration,
    scheduler: &mut S,
) {
    let task = scheduler.schedule_in(delay, ScheduledTask::RefreshNode(node.id()));

    if let Some(previous) = node.replace_refresh_task(Some(task)) {
        scheduler.cancel(previous);
    }
}

fn disarm_refresh<S: Scheduler<ScheduledTask>>(node: &mut RoutingNode, scheduler: &mut S) {
    if let Some(previous) = node.replace_refresh_task(None) {
        scheduler.cancel(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::log_distance;
    use crate::test::{self, RecordingScheduler};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU16, Ordering};

    fn setup(config: Config) -> (RoutingManager, RecordingScheduler<ScheduledTask>) {
        let now = Instant::now();
        let local = NodeHandle::new(rand::random(), test::dummy_socket_addr_v4());

        (
            RoutingManager::new(local, config, now),
            RecordingScheduler::new(now),
        )
    }

    // Every node gets its own port so that probes can be told apart.
    fn node_at(manager: &RoutingManager, log_dist: i16) -> NodeHandle {
        static NEXT_PORT: AtomicU16 = AtomicU16::new(1);
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);

        NodeHandle::new(
            generate_close_id(manager.node_id(), log_dist),
            (Ipv4Addr::LOCALHOST, port).into(),
        )
    }

    fn refresh_tasks(scheduler: &RecordingScheduler<ScheduledTask>, id: NodeId) -> usize {
        scheduler
            .pending()
            .into_iter()
            .filter(|task| *task == ScheduledTask::RefreshNode(id))
            .count()
    }

    #[test]
    fn positive_response_inserts_into_main() {
        let (mut manager, mut scheduler) = setup(Config::default());
        let node = node_at(&manager, 150);
        let now = Instant::now();
        let rtt = Duration::from_millis(40);

        manager.on_response_received(node, Some(rtt), true, now, &mut scheduler);

        // The inserting response already confirms the node.
        let inserted = manager.table().get_main(&node.id).unwrap();
        assert!(!inserted.in_quarantine());
        assert!(inserted.is_ns());
        assert_eq!(inserted.rtt(), Some(rtt));
        assert_eq!(
            scheduler.pending_with_delay(),
            vec![(
                Config::default().refresh_period,
                ScheduledTask::RefreshNode(node.id)
            )]
        );
    }

    #[test]
    fn positive_unanswered_replacement_stays_quarantined() {
        let config = Config {
            bucket_size: 1,
            ..Config::default()
        };
        let (mut manager, mut scheduler) = setup(config);
        let now = Instant::now();

        let responder = node_at(&manager, 150);
        manager.on_response_received(responder, None, false, now, &mut scheduler);

        let sender = node_at(&manager, 150);
        manager.on_query_received(sender, now, &mut scheduler);

        let replacement = manager.table().get_replacement(&sender.id).unwrap();
        assert!(replacement.in_quarantine());
        assert!(scheduler.pending_with_delay().contains(&(
            Config::default().quarantine_period,
            ScheduledTask::RefreshNode(sender.id)
        )));
    }

    #[test]
    fn positive_query_from_known_node_rearms_refresh() {
        let (mut manager, mut scheduler) = setup(Config::default());
        let node = node_at(&manager, 140);
        let now = Instant::now();

        manager.on_response_received(node, None, false, now, &mut scheduler);
        for _ in 0..3 {
            let queries = manager.on_query_received(node, now, &mut scheduler);
            assert!(queries.is_empty());
        }

        assert_eq!(refresh_tasks(&scheduler, node.id), 1);
    }

    #[test]
    fn positive_query_from_unknown_node_is_pinged() {
        let (mut manager, mut scheduler) = setup(Config::default());
        let node = node_at(&manager, 140);

        let queries = manager.on_query_received(node, Instant::now(), &mut scheduler);

        assert_eq!(
            queries,
            vec![OutgoingQuery::new(node.into(), Query::Ping, Purpose::Ping)]
        );
        assert!(manager.table().get_main(&node.id).is_err());
        assert_eq!(manager.table().num_rnodes(), 1);
    }

    #[test]
    fn positive_query_with_full_main_goes_to_replacement() {
        let config = Config {
            bucket_size: 2,
            ..Config::default()
        };
        let (mut manager, mut scheduler) = setup(config);
        let now = Instant::now();

        for _ in 0..2 {
            let node = node_at(&manager, 150);
            manager.on_response_received(node, None, false, now, &mut scheduler);
        }

        let sender = node_at(&manager, 150);
        let queries = manager.on_query_received(sender, now, &mut scheduler);

        assert!(queries.is_empty());
        assert!(manager.table().get_replacement(&sender.id).is_ok());
    }

    #[test]
    fn positive_promotion_from_replacement() {
        let config = Config::default();
        let max_timeouts = config.max_timeouts;
        let (mut manager, mut scheduler) = setup(config);
        let now = Instant::now();

        let main_nodes: Vec<_> = (0..8).map(|_| node_at(&manager, 150)).collect();
        for node in &main_nodes {
            manager.on_response_received(*node, None, false, now, &mut scheduler);
        }

        let r1 = node_at(&manager, 150);
        manager.on_response_received(r1, None, false, now, &mut scheduler);
        assert!(manager.table().get_replacement(&r1.id).is_ok());

        let n1 = main_nodes[0];
        for _ in 0..max_timeouts {
            manager.on_timeout(n1.into(), &mut scheduler);
            assert!(manager.table().get_main(&n1.id).is_ok());
        }

        manager.on_timeout(n1.into(), &mut scheduler);
        assert!(manager.table().get_main(&n1.id).is_err());
        assert!(manager.table().get_replacement(&n1.id).is_ok());

        manager.on_response_received(r1, None, false, now, &mut scheduler);

        let promoted = manager.table().get_main(&r1.id).unwrap();
        assert_eq!(promoted.consecutive_timeouts(), 0);
        assert!(manager.table().get_replacement(&r1.id).is_err());
        assert_eq!(manager.table().num_rnodes(), 9);
    }

    #[test]
    fn positive_removal_pings_ns_replacements() {
        let config = Config {
            bucket_size: 1,
            max_timeouts: 0,
            ..Config::default()
        };
        let (mut manager, mut scheduler) = setup(config);
        let now = Instant::now();

        let n1 = node_at(&manager, 150);
        let ns = node_at(&manager, 150);
        manager.on_response_received(n1, None, false, now, &mut scheduler);
        manager.on_response_received(ns, None, true, now, &mut scheduler);
        assert!(manager.table().get_replacement(&ns.id).is_ok());

        let queries = manager.on_timeout(n1.into(), &mut scheduler);

        assert_eq!(
            queries,
            vec![OutgoingQuery::new(ns.into(), Query::Ping, Purpose::Refresh)]
        );
        // The bucket only holds one entry, so the timed out node displaced the NS node.
        assert!(manager.table().get_replacement(&n1.id).is_ok());
        assert!(manager.table().get_replacement(&ns.id).is_err());
        assert_eq!(refresh_tasks(&scheduler, ns.id), 0);
    }

    #[test]
    fn negative_main_with_room_but_replacements_waiting() {
        let config = Config {
            bucket_size: 2,
            max_timeouts: 0,
            ..Config::default()
        };
        let (mut manager, mut scheduler) = setup(config);
        let now = Instant::now();

        let n1 = node_at(&manager, 150);
        let n2 = node_at(&manager, 150);
        let r1 = node_at(&manager, 150);
        for node in [n1, n2, r1] {
            manager.on_response_received(node, None, false, now, &mut scheduler);
        }

        manager.on_timeout(n1.into(), &mut scheduler);
        assert!(manager.table().has_room_main(&n1.id));

        let newcomer = node_at(&manager, 150);
        manager.on_response_received(newcomer, None, false, now, &mut scheduler);

        // The newcomer queues behind `r1` and takes the slot of the dead `n1`.
        assert!(manager.table().get_main(&newcomer.id).is_err());
        assert!(manager.table().get_replacement(&newcomer.id).is_ok());
        assert!(manager.table().get_replacement(&r1.id).is_ok());
        assert!(manager.table().get_replacement(&n1.id).is_err());
    }

    #[test]
    fn negative_single_timeout_keeps_node() {
        let (mut manager, mut scheduler) = setup(Config::default());
        let node = node_at(&manager, 120);
        let now = Instant::now();

        manager.on_response_received(node, None, false, now, &mut scheduler);
        manager.on_timeout(node.into(), &mut scheduler);

        let entry = manager.table().get_main(&node.id).unwrap();
        assert_eq!(entry.consecutive_timeouts(), 1);

        manager.on_response_received(node, None, false, now, &mut scheduler);
        let entry = manager.table().get_main(&node.id).unwrap();
        assert_eq!(entry.consecutive_timeouts(), 0);
    }

    #[test]
    fn negative_seed_timeout_is_ignored() {
        let (mut manager, mut scheduler) = setup(Config::default());

        let queries = manager.on_timeout(
            Contact::Seed(test::dummy_socket_addr_v4()),
            &mut scheduler,
        );

        assert!(queries.is_empty());
        assert_eq!(manager.table().num_rnodes(), 1);
    }

    #[test]
    #[should_panic]
    fn negative_local_node_timeout_panics() {
        let (mut manager, mut scheduler) = setup(Config::default());
        let local = *manager.table().local();

        manager.on_timeout(local.into(), &mut scheduler);
    }

    #[test]
    fn positive_nodes_found_respects_probe_budget() {
        let config = Config {
            max_concurrent_refresh_msgs: 2,
            ..Config::default()
        };
        let (mut manager, _) = setup(config);

        let plain: Vec<_> = (0..3).map(|i| node_at(&manager, 100 + i)).collect();
        let ns = node_at(&manager, 90);

        let found = vec![(plain[0], false), (plain[1], false), (plain[2], false), (ns, true)];
        let queries = manager.on_nodes_found(&found);

        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].contact, ns.into());
        assert!(queries
            .iter()
            .all(|query| query.purpose == Purpose::Probe
                && query.query == Query::FindNode(manager.node_id())));

        // Budget is exhausted until a probe finishes.
        assert!(manager.on_nodes_found(&found).is_empty());

        manager.probe_finished(ns.addr);
        assert_eq!(manager.on_nodes_found(&[(plain[2], false)]).len(), 1);
    }

    #[test]
    fn negative_nodes_found_skips_known_and_local() {
        let (mut manager, mut scheduler) = setup(Config::default());
        let known = node_at(&manager, 100);
        manager.on_response_received(known, None, false, Instant::now(), &mut scheduler);

        let local = *manager.table().local();
        let queries = manager.on_nodes_found(&[(known, false), (local, false)]);

        assert!(queries.is_empty());
    }

    #[test]
    fn positive_refresh_targets_node_bucket() {
        let (mut manager, mut scheduler) = setup(Config::default());
        let node = node_at(&manager, 77);
        manager.on_response_received(node, None, false, Instant::now(), &mut scheduler);

        let queries = manager.on_refresh_due(node.id, &mut scheduler);
        assert_eq!(queries.len(), 1);

        let query = queries[0];
        assert_eq!(query.contact, node.into());
        assert_eq!(query.purpose, Purpose::Refresh);
        match query.query {
            Query::FindNode(target) => {
                assert_eq!(log_distance(&manager.node_id(), &target), 77)
            }
            other => panic!("unexpected query {:?}", other),
        }

        assert_eq!(refresh_tasks(&scheduler, node.id), 1);
    }

    #[test]
    fn negative_refresh_of_removed_node() {
        let (mut manager, mut scheduler) = setup(Config::default());

        let queries = manager.on_refresh_due(test::dummy_handle().id, &mut scheduler);

        assert!(queries.is_empty());
        assert_eq!(scheduler.len(), 0);
    }

    #[test]
    fn positive_bootstrap_convergence() {
        let config = Config::default();
        let min_nodes = config.min_bootstrap_nodes;
        let (mut manager, mut scheduler) = setup(config);
        let now = Instant::now();

        let seeds = test::dummy_block_socket_addrs(3);
        let queries = manager.do_bootstrap(seeds.clone(), &mut scheduler);

        assert_eq!(queries.len(), 1);
        assert!(seeds.contains(&queries[0].contact.addr()));
        assert_eq!(queries[0].contact.id(), None);
        assert_eq!(queries[0].purpose, Purpose::Bootstrap);
        assert_eq!(manager.mode(), Mode::Bootstrap);

        let max_rounds = (min_nodes - 1 + 7) / 8;
        let mut next_dist = 159;
        let mut rounds = 0;

        while manager.mode() == Mode::Bootstrap {
            assert!(rounds < max_rounds, "did not converge");
            rounds += 1;

            // A response carrying 8 fresh nodes, each in its own bucket.
            let found: Vec<_> = (0..8)
                .map(|_| {
                    next_dist -= 1;
                    (node_at(&manager, next_dist), false)
                })
                .collect();

            for query in manager.on_nodes_found(&found) {
                if let Contact::Node(node) = query.contact {
                    manager.probe_finished(node.addr);
                    manager.on_response_received(node, None, false, now, &mut scheduler);
                }
            }
        }

        assert_eq!(rounds, max_rounds);
        assert!(manager.table().num_rnodes() >= min_nodes);
        assert!(!scheduler
            .pending()
            .contains(&ScheduledTask::BootstrapStep));
    }

    #[test]
    fn positive_bootstrap_ends_when_seeds_exhausted() {
        let (mut manager, mut scheduler) = setup(Config::default());

        let seeds = test::dummy_block_socket_addrs(2);
        let first = manager.do_bootstrap(seeds.clone(), &mut scheduler);
        assert_eq!(scheduler.pending(), vec![ScheduledTask::BootstrapStep]);

        assert_eq!(scheduler.pop_next(), Some(ScheduledTask::BootstrapStep));
        let second = manager.bootstrap_step(&mut scheduler);

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].contact, second[0].contact);
        assert_eq!(manager.mode(), Mode::Bootstrap);

        assert_eq!(scheduler.pop_next(), Some(ScheduledTask::BootstrapStep));
        assert!(manager.bootstrap_step(&mut scheduler).is_empty());
        assert_eq!(manager.mode(), Mode::Normal);
        assert_eq!(scheduler.len(), 0);
    }
}
