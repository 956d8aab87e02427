use super::{
    timer::{Scheduler, Timeout},
    HealthError, ScheduledTask,
};
use crate::{
    bloom::BloomFilter,
    config::Config,
    id::{InfoHash, NodeId},
    message::{Response, ScrapeFilters},
    routing::node::{Contact, NodeHandle},
    time::Instant,
    transaction::{OutgoingQuery, Purpose, Query},
};
use rand::seq::SliceRandom;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    time::Duration,
};
use tokio::sync::oneshot;

/// Estimated swarm size of an infohash.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HealthResult {
    pub infohash: InfoHash,
    pub seeders: u32,
    pub leechers: u32,
    pub checked_at: Instant,
}

type Waiter = oneshot::Sender<Result<HealthResult, HealthError>>;

struct Lookup {
    bf_seeders: BloomFilter,
    bf_peers: BloomFilter,
    // Every address a `get_peers` was sent or queued to.
    queried: HashSet<SocketAddr>,
    // Nodes taken from `nodes` lists, capped at `max_nodes_per_lookup`.
    discovered: usize,
    responses_with_bf: u32,
    deadline: Instant,
    waiters: Vec<Waiter>,
    fanout: VecDeque<NodeHandle>,
    fanout_task: Option<Timeout>,
    deadline_task: Timeout,
}

/// In-flight BEP33 health lookups and the cache of their results.
pub(crate) struct HealthLookups {
    config: Config,
    // Records carrying our own id are never queried.
    local_id: NodeId,
    lookups: HashMap<InfoHash, Lookup>,
    cache: HashMap<InfoHash, HealthResult>,
}

impl HealthLookups {
    pub fn new(config: Config, local_id: NodeId) -> Self {
        Self {
            config,
            local_id,
            lookups: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn is_active(&self, info_hash: &InfoHash) -> bool {
        self.lookups.contains_key(info_hash)
    }

    /// Answer `tx` with the health of `info_hash`, from the cache, from a lookup already in
    /// progress or from a new one seeded with a random router and the `closest` known nodes.
    #[allow(clippy::too_many_arguments)]
    pub fn start<S: Scheduler<ScheduledTask>>(
        &mut self,
        info_hash: InfoHash,
        timeout: Duration,
        tx: Waiter,
        routers: &[SocketAddr],
        closest: &[NodeHandle],
        now: Instant,
        scheduler: &mut S,
    ) -> Vec<OutgoingQuery> {
        let ttl = self.config.cache_ttl;
        self.cache
            .retain(|_, result| now.duration_since(result.checked_at) < ttl);

        if let Some(result) = self.cache.get(&info_hash) {
            log::debug!("Health of {:?} served from cache", info_hash);
            tx.send(Ok(*result)).unwrap_or(());
            return Vec::new();
        }

        if let Some(lookup) = self.lookups.get_mut(&info_hash) {
            lookup.waiters.push(tx);
            return Vec::new();
        }

        let deadline_task = scheduler.schedule_in(timeout, ScheduledTask::LookupDeadline(info_hash));

        let mut lookup = Lookup {
            bf_seeders: BloomFilter::new(),
            bf_peers: BloomFilter::new(),
            queried: HashSet::new(),
            discovered: 0,
            responses_with_bf: 0,
            deadline: now + timeout,
            waiters: vec![tx],
            fanout: VecDeque::new(),
            fanout_task: None,
            deadline_task,
        };

        let mut queries = Vec::new();

        if let Some(router) = routers.choose(&mut rand::thread_rng()) {
            lookup.queried.insert(*router);
            queries.push(OutgoingQuery::new(
                Contact::Seed(*router),
                Query::GetPeers(info_hash),
                Purpose::Lookup(info_hash),
            ));
        }

        for node in closest.iter().filter(|node| node.id != self.local_id) {
            if lookup.queried.insert(node.addr) {
                queries.push(OutgoingQuery::new(
                    (*node).into(),
                    Query::GetPeers(info_hash),
                    Purpose::Lookup(info_hash),
                ));
            }
        }

        log::debug!(
            "Starting health lookup for {:?} with {} initial queries",
            info_hash,
            queries.len()
        );

        self.lookups.insert(info_hash, lookup);

        queries
    }

    /// Integrate a `get_peers` response of the lookup for `info_hash`.
    pub fn on_response<S: Scheduler<ScheduledTask>>(
        &mut self,
        info_hash: InfoHash,
        response: &Response,
        now: Instant,
        scheduler: &mut S,
    ) -> Vec<OutgoingQuery> {
        if !self.prune_waiters(info_hash, scheduler) {
            return Vec::new();
        }

        let max_responses = self.config.max_responses;
        let max_nodes = self.config.max_nodes_per_lookup;
        let local_id = self.local_id;

        let lookup = match self.lookups.get_mut(&info_hash) {
            Some(lookup) => lookup,
            None => return Vec::new(),
        };

        // The deadline is final even if its timer has not been processed yet.
        if now >= lookup.deadline {
            self.finalize(info_hash, now, scheduler);
            return Vec::new();
        }

        match response.scrape_filters() {
            ScrapeFilters::Valid { seeders, peers } => {
                lookup.bf_seeders |= &seeders;
                lookup.bf_peers |= &peers;
                lookup.responses_with_bf += 1;
            }
            ScrapeFilters::Malformed => {
                log::debug!("Discarding response with malformed scrape filters");
                return Vec::new();
            }
            ScrapeFilters::Missing => (),
        }

        if lookup.responses_with_bf >= max_responses {
            self.finalize(info_hash, now, scheduler);
            return Vec::new();
        }

        for node in response.nodes.iter().filter(|node| node.id != local_id) {
            if lookup.discovered >= max_nodes {
                log::trace!("Lookup for {:?} reached its node cap", info_hash);
                break;
            }

            if lookup.queried.insert(node.addr) {
                lookup.discovered += 1;
                lookup.fanout.push_back(*node);
            }
        }

        if lookup.fanout_task.is_none() {
            self.send_next(info_hash, scheduler)
        } else {
            Vec::new()
        }
    }

    /// The pause between two fan-out sends is over.
    pub fn on_fanout<S: Scheduler<ScheduledTask>>(
        &mut self,
        info_hash: InfoHash,
        scheduler: &mut S,
    ) -> Vec<OutgoingQuery> {
        if let Some(lookup) = self.lookups.get_mut(&info_hash) {
            lookup.fanout_task = None;
        }

        if !self.prune_waiters(info_hash, scheduler) {
            return Vec::new();
        }

        self.send_next(info_hash, scheduler)
    }

    pub fn on_deadline<S: Scheduler<ScheduledTask>>(
        &mut self,
        info_hash: InfoHash,
        now: Instant,
        scheduler: &mut S,
    ) {
        if self.prune_waiters(info_hash, scheduler) {
            self.finalize(info_hash, now, scheduler)
        }
    }

    /// Fail every pending lookup with `Cancelled`.
    pub fn cancel_all(&mut self) {
        for (_, lookup) in self.lookups.drain() {
            for tx in lookup.waiters {
                tx.send(Err(HealthError::Cancelled)).unwrap_or(());
            }
        }

        self.cache.clear();
    }

    fn send_next<S: Scheduler<ScheduledTask>>(
        &mut self,
        info_hash: InfoHash,
        scheduler: &mut S,
    ) -> Vec<OutgoingQuery> {
        let interval = self.config.fanout_interval;

        let lookup = match self.lookups.get_mut(&info_hash) {
            Some(lookup) => lookup,
            None => return Vec::new(),
        };

        let node = match lookup.fanout.pop_front() {
            Some(node) => node,
            None => return Vec::new(),
        };

        lookup.fanout_task =
            Some(scheduler.schedule_in(interval, ScheduledTask::LookupFanout(info_hash)));

        vec![OutgoingQuery::new(
            node.into(),
            Query::GetPeers(info_hash),
            Purpose::Lookup(info_hash),
        )]
    }

    // Drops the lookup if every caller went away. Returns whether the lookup is still alive.
    fn prune_waiters<S: Scheduler<ScheduledTask>>(
        &mut self,
        info_hash: InfoHash,
        scheduler: &mut S,
    ) -> bool {
        let lookup = match self.lookups.get_mut(&info_hash) {
            Some(lookup) => lookup,
            None => return false,
        };

        lookup.waiters.retain(|tx| !tx.is_closed());

        if !lookup.waiters.is_empty() {
            return true;
        }

        if let Some(lookup) = self.lookups.remove(&info_hash) {
            cancel_tasks(&lookup, scheduler);
        }

        log::debug!("Health lookup for {:?} cancelled by its callers", info_hash);

        false
    }

    fn finalize<S: Scheduler<ScheduledTask>>(
        &mut self,
        info_hash: InfoHash,
        now: Instant,
        scheduler: &mut S,
    ) {
        let lookup = match self.lookups.remove(&info_hash) {
            Some(lookup) => lookup,
            None => return,
        };

        cancel_tasks(&lookup, scheduler);

        let result = HealthResult {
            infohash: info_hash,
            seeders: lookup.bf_seeders.estimate_count(),
            leechers: lookup.bf_peers.estimate_count(),
            checked_at: now,
        };

        log::info!(
            "Health of {:?}: {} seeders, {} leechers ({} responses, {} nodes queried)",
            info_hash,
            result.seeders,
            result.leechers,
            lookup.responses_with_bf,
            lookup.queried.len()
        );

        self.cache.insert(info_hash, result);

        for tx in lookup.waiters {
            tx.send(Ok(result)).unwrap_or(());
        }
    }
}

fn cancel_tasks<S: Scheduler<ScheduledTask>>(lookup: &Lookup, scheduler: &mut S) {
    if let Some(task) = lookup.fanout_task {
        scheduler.cancel(task);
    }

    scheduler.cancel(lookup.deadline_task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BLOOM_FILTER_LEN;
    use crate::test::{self, RecordingScheduler};
    use std::net::Ipv4Addr;

    const TIMEOUT: Duration = Duration::from_secs(15);

    fn local_id() -> NodeId {
        NodeId::from([0x5a; 20])
    }

    fn setup(config: Config) -> (HealthLookups, RecordingScheduler<ScheduledTask>, Instant) {
        let now = Instant::now();
        (
            HealthLookups::new(config, local_id()),
            RecordingScheduler::new(now),
            now,
        )
    }

    fn nodes(count: u16, first_port: u16) -> Vec<NodeHandle> {
        (0..count)
            .map(|i| NodeHandle::new(rand::random(), (Ipv4Addr::LOCALHOST, first_port + i).into()))
            .collect()
    }

    fn filters(seeders: u8, peers: u8) -> (Vec<u8>, Vec<u8>) {
        let mut bf_seeders = BloomFilter::new();
        let mut bf_peers = BloomFilter::new();

        for i in 0..seeders {
            bf_seeders.insert_ip(Ipv4Addr::new(10, 0, 0, i).into());
        }

        for i in 0..peers {
            bf_peers.insert_ip(Ipv4Addr::new(10, 1, 0, i).into());
        }

        (bf_seeders.as_ref().to_vec(), bf_peers.as_ref().to_vec())
    }

    fn scrape_response(seeders: u8, peers: u8) -> Response {
        let (bf_seeders, bf_peers) = filters(seeders, peers);

        Response {
            id: rand::random(),
            bf_seeders: Some(bf_seeders),
            bf_peers: Some(bf_peers),
            ..Default::default()
        }
    }

    #[test]
    fn positive_start_seeds_router_and_closest() {
        let (mut lookups, mut scheduler, now) = setup(Config::default());
        let info_hash: InfoHash = rand::random();
        let routers = test::dummy_block_socket_addrs(2);
        let closest = nodes(3, 7000);
        let (tx, _rx) = oneshot::channel();

        let queries = lookups.start(info_hash, TIMEOUT, tx, &routers, &closest, now, &mut scheduler);

        assert_eq!(queries.len(), 4);
        assert!(matches!(queries[0].contact, Contact::Seed(addr) if routers.contains(&addr)));
        for (query, node) in queries[1..].iter().zip(&closest) {
            assert_eq!(query.contact, Contact::Node(*node));
        }
        assert!(queries.iter().all(|query| query.query == Query::GetPeers(info_hash)
            && query.purpose == Purpose::Lookup(info_hash)));

        assert_eq!(
            scheduler.pending_with_delay(),
            vec![(TIMEOUT, ScheduledTask::LookupDeadline(info_hash))]
        );
    }

    #[test]
    fn positive_concurrent_calls_share_lookup() {
        let (mut lookups, mut scheduler, now) = setup(Config::default());
        let info_hash: InfoHash = rand::random();
        let routers = test::dummy_block_socket_addrs(1);

        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();

        assert_eq!(
            lookups
                .start(info_hash, TIMEOUT, tx1, &routers, &[], now, &mut scheduler)
                .len(),
            1
        );
        assert!(lookups
            .start(info_hash, TIMEOUT, tx2, &routers, &[], now, &mut scheduler)
            .is_empty());
        assert_eq!(scheduler.len(), 1);

        lookups.on_response(info_hash, &scrape_response(10, 20), now, &mut scheduler);
        lookups.on_deadline(info_hash, now + TIMEOUT, &mut scheduler);

        let first = rx1.try_recv().unwrap().unwrap();
        let second = rx2.try_recv().unwrap().unwrap();
        assert_eq!(first, second);
        assert!(first.seeders > 0);
        assert!(first.leechers > first.seeders);
        assert!(!lookups.is_active(&info_hash));
        assert_eq!(scheduler.len(), 0);
    }

    #[test]
    fn positive_cached_result_skips_walk() {
        let (mut lookups, mut scheduler, now) = setup(Config::default());
        let info_hash: InfoHash = rand::random();
        let routers = test::dummy_block_socket_addrs(1);

        let (tx, mut rx) = oneshot::channel();
        lookups.start(info_hash, TIMEOUT, tx, &routers, &[], now, &mut scheduler);
        lookups.on_response(info_hash, &scrape_response(5, 5), now, &mut scheduler);
        lookups.on_deadline(info_hash, now, &mut scheduler);
        let first = rx.try_recv().unwrap().unwrap();

        let (tx, mut rx) = oneshot::channel();
        let later = now + Duration::from_secs(29);
        let queries = lookups.start(info_hash, TIMEOUT, tx, &routers, &[], later, &mut scheduler);

        assert!(queries.is_empty());
        assert_eq!(rx.try_recv().unwrap().unwrap(), first);

        // Past the ttl the walk starts again.
        let (tx, _rx) = oneshot::channel();
        let expired = now + Duration::from_secs(30);
        let queries = lookups.start(info_hash, TIMEOUT, tx, &routers, &[], expired, &mut scheduler);
        assert_eq!(queries.len(), 1);
    }

    #[test]
    fn positive_fanout_is_paced_and_deduplicated() {
        let config = Config::default();
        let interval = config.fanout_interval;
        let (mut lookups, mut scheduler, now) = setup(config);
        let info_hash: InfoHash = rand::random();
        let closest = nodes(1, 7000);
        let (tx, _rx) = oneshot::channel();

        lookups.start(info_hash, TIMEOUT, tx, &[], &closest, now, &mut scheduler);

        // The already queried node and a duplicate entry are not queued again.
        let discovered = nodes(3, 8000);
        let response = Response {
            id: rand::random(),
            nodes: vec![closest[0], discovered[0], discovered[1], discovered[1], discovered[2]],
            ..Default::default()
        };

        let queries = lookups.on_response(info_hash, &response, now, &mut scheduler);
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].contact, Contact::Node(discovered[0]));
        assert!(scheduler
            .pending_with_delay()
            .contains(&(interval, ScheduledTask::LookupFanout(info_hash))));

        // Responses arriving during the pause only queue.
        assert!(lookups
            .on_response(info_hash, &response, now, &mut scheduler)
            .is_empty());

        let mut sent = vec![queries[0].contact];
        loop {
            let queries = lookups.on_fanout(info_hash, &mut scheduler);
            if queries.is_empty() {
                break;
            }
            sent.extend(queries.iter().map(|query| query.contact));
        }

        let expected: Vec<Contact> = discovered.iter().map(|node| (*node).into()).collect();
        assert_eq!(sent, expected);
    }

    #[test]
    fn negative_own_record_not_queued() {
        let (mut lookups, mut scheduler, now) = setup(Config::default());
        let info_hash: InfoHash = rand::random();
        let (tx, _rx) = oneshot::channel();

        lookups.start(info_hash, TIMEOUT, tx, &[], &[], now, &mut scheduler);

        let response = Response {
            id: rand::random(),
            nodes: vec![NodeHandle::new(local_id(), (Ipv4Addr::LOCALHOST, 6881).into())],
            ..Default::default()
        };

        assert!(lookups
            .on_response(info_hash, &response, now, &mut scheduler)
            .is_empty());
        assert!(lookups.on_fanout(info_hash, &mut scheduler).is_empty());
        assert!(!scheduler
            .pending()
            .contains(&ScheduledTask::LookupFanout(info_hash)));
    }

    #[test]
    fn negative_own_record_not_seeded() {
        let (mut lookups, mut scheduler, now) = setup(Config::default());
        let info_hash: InfoHash = rand::random();
        let mut closest = nodes(2, 7100);
        closest.insert(1, NodeHandle::new(local_id(), (Ipv4Addr::LOCALHOST, 7200).into()));
        let (tx, _rx) = oneshot::channel();

        let queries = lookups.start(info_hash, TIMEOUT, tx, &[], &closest, now, &mut scheduler);

        let contacts: Vec<_> = queries.iter().map(|query| query.contact).collect();
        assert_eq!(
            contacts,
            vec![Contact::Node(closest[0]), Contact::Node(closest[2])]
        );
    }

    #[test]
    fn negative_node_cap_per_lookup() {
        let config = Config {
            max_nodes_per_lookup: 3,
            ..Config::default()
        };
        let (mut lookups, mut scheduler, now) = setup(config);
        let info_hash: InfoHash = rand::random();
        let (tx, _rx) = oneshot::channel();

        lookups.start(info_hash, TIMEOUT, tx, &[], &[], now, &mut scheduler);

        let response = Response {
            id: rand::random(),
            nodes: nodes(5, 9000),
            ..Default::default()
        };

        let mut sent = lookups.on_response(info_hash, &response, now, &mut scheduler);
        loop {
            let queries = lookups.on_fanout(info_hash, &mut scheduler);
            if queries.is_empty() {
                break;
            }
            sent.extend(queries);
        }

        let more = Response {
            id: rand::random(),
            nodes: nodes(2, 9100),
            ..Default::default()
        };
        sent.extend(lookups.on_response(info_hash, &more, now, &mut scheduler));

        assert_eq!(sent.len(), 3);
    }

    #[test]
    fn negative_response_at_deadline_not_integrated() {
        let (mut lookups, mut scheduler, now) = setup(Config::default());
        let info_hash: InfoHash = rand::random();
        let (tx, mut rx) = oneshot::channel();

        lookups.start(info_hash, TIMEOUT, tx, &[], &[], now, &mut scheduler);
        lookups.on_response(info_hash, &scrape_response(50, 50), now + TIMEOUT, &mut scheduler);

        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!((result.seeders, result.leechers), (0, 0));
        assert!(!lookups.is_active(&info_hash));
    }

    #[test]
    fn positive_max_responses_finalizes_early() {
        let config = Config {
            max_responses: 2,
            ..Config::default()
        };
        let (mut lookups, mut scheduler, now) = setup(config);
        let info_hash: InfoHash = rand::random();
        let (tx, mut rx) = oneshot::channel();

        lookups.start(info_hash, TIMEOUT, tx, &[], &[], now, &mut scheduler);

        lookups.on_response(info_hash, &scrape_response(3, 0), now, &mut scheduler);
        assert!(rx.try_recv().is_err());

        lookups.on_response(info_hash, &scrape_response(0, 4), now, &mut scheduler);
        let result = rx.try_recv().unwrap().unwrap();

        assert!(result.seeders > 0);
        assert!(result.leechers > 0);
        assert_eq!(scheduler.len(), 0);
    }

    #[test]
    fn negative_malformed_filters_discarded() {
        let (mut lookups, mut scheduler, now) = setup(Config::default());
        let info_hash: InfoHash = rand::random();
        let (tx, mut rx) = oneshot::channel();

        lookups.start(info_hash, TIMEOUT, tx, &[], &[], now, &mut scheduler);

        let mut response = scrape_response(30, 30);
        response.bf_peers = Some(vec![0xff; BLOOM_FILTER_LEN - 1]);
        response.nodes = nodes(2, 9500);

        assert!(lookups
            .on_response(info_hash, &response, now, &mut scheduler)
            .is_empty());

        lookups.on_deadline(info_hash, now, &mut scheduler);
        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!((result.seeders, result.leechers), (0, 0));
    }

    #[test]
    fn negative_dropped_receiver_cancels_lookup() {
        let (mut lookups, mut scheduler, now) = setup(Config::default());
        let info_hash: InfoHash = rand::random();
        let (tx, rx) = oneshot::channel();

        lookups.start(info_hash, TIMEOUT, tx, &[], &[], now, &mut scheduler);
        drop(rx);

        assert!(lookups
            .on_response(info_hash, &scrape_response(1, 1), now, &mut scheduler)
            .is_empty());
        assert!(!lookups.is_active(&info_hash));
        assert_eq!(scheduler.len(), 0);
    }

    #[test]
    fn negative_abandoned_lookup_not_cached() {
        let (mut lookups, mut scheduler, now) = setup(Config::default());
        let info_hash: InfoHash = rand::random();
        let routers = test::dummy_block_socket_addrs(1);
        let (tx, rx) = oneshot::channel();

        lookups.start(info_hash, TIMEOUT, tx, &routers, &[], now, &mut scheduler);
        drop(rx);
        let later = now + TIMEOUT;
        lookups.on_deadline(info_hash, later, &mut scheduler);

        assert!(!lookups.is_active(&info_hash));
        assert_eq!(scheduler.len(), 0);

        // Nothing was cached, so the next caller walks again.
        let (tx, _rx) = oneshot::channel();
        let queries = lookups.start(info_hash, TIMEOUT, tx, &routers, &[], later, &mut scheduler);
        assert_eq!(queries.len(), 1);
    }

    #[test]
    fn negative_cancel_all() {
        let (mut lookups, mut scheduler, now) = setup(Config::default());
        let info_hash: InfoHash = rand::random();
        let (tx, mut rx) = oneshot::channel();

        lookups.start(info_hash, TIMEOUT, tx, &[], &[], now, &mut scheduler);
        lookups.cancel_all();

        assert_eq!(rx.try_recv().unwrap(), Err(HealthError::Cancelled));
        assert!(!lookups.is_active(&info_hash));
    }
}
