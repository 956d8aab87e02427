use super::{
    lookup::HealthLookups, resolve, timer::Timer, HealthError, HealthResult, OneshotTask,
    ScheduledTask, Socket,
};
use crate::{
    config::{Config, NS_VERSION_PREFIX},
    id::{InfoHash, NodeId},
    message::{
        FindNodeRequest, GetPeersRequest, Message, MessageBody, PingRequest, Request, Response,
    },
    routing::{
        bucket::MAX_BUCKET_SIZE,
        manager::RoutingManager,
        node::{Contact, NodeHandle},
    },
    time::Clock,
    transaction::{
        OutgoingQuery, PendingRequest, Purpose, Query, RpcError, TransactionId, Transactions,
    },
};
use futures_util::StreamExt;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    select,
    sync::{mpsc, oneshot},
};

/// Storage for our EventLoop to invoke actions upon.
pub(crate) struct DhtHandler {
    running: bool,
    config: Config,
    clock: Arc<dyn Clock>,
    socket: Socket,
    command_rx: mpsc::Receiver<OneshotTask>,
    timer: Timer<ScheduledTask>,
    transactions: Transactions,
    manager: RoutingManager,
    lookups: HealthLookups,
    routers: Vec<SocketAddr>,
}

impl DhtHandler {
    pub fn new(
        node_id: NodeId,
        config: Config,
        clock: Arc<dyn Clock>,
        socket: Socket,
        command_rx: mpsc::Receiver<OneshotTask>,
    ) -> Self {
        let local = NodeHandle::new(node_id, socket.local_addr());
        let manager = RoutingManager::new(local, config.clone(), clock.now());
        let lookups = HealthLookups::new(config.clone(), node_id);
        let timer = Timer::new(clock.clone());

        Self {
            running: true,
            config,
            clock,
            socket,
            command_rx,
            timer,
            transactions: Transactions::new(),
            manager,
            lookups,
            routers: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        self.routers = resolve(&self.config.routers).await;
        log::debug!("Resolved {} routers", self.routers.len());

        while self.running {
            self.run_once().await
        }

        log::info!("DhtHandler gracefully shut down");
    }

    async fn run_once(&mut self) {
        select! {
            task = self.timer.next(), if !self.timer.is_empty() => {
                if let Some(task) = task {
                    self.handle_timeout(task).await
                }
            }
            command = self.command_rx.recv() => {
                if let Some(command) = command {
                    self.handle_command(command).await
                } else {
                    self.shutdown()
                }
            }
            message = self.socket.recv() => {
                match message {
                    Ok((message, addr)) => self.handle_incoming(message, addr).await,
                    Err((RpcError::Io(error), _)) => {
                        log::warn!("Failed to receive incoming message: {}", error)
                    }
                    Err((error, addr)) => {
                        log::debug!("Dropping datagram from {addr:?}: {}", error)
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, task: OneshotTask) {
        match task {
            OneshotTask::Bootstrap(seeds) => {
                let queries = self.manager.do_bootstrap(seeds, &mut self.timer);
                self.send_queries(queries).await;
            }
            OneshotTask::CheckHealth {
                info_hash,
                timeout,
                tx,
            } => {
                self.handle_check_health(info_hash, timeout, tx).await;
            }
            OneshotTask::ClosestNodes { target, k, tx } => {
                tx.send(self.manager.closest(&target, k)).unwrap_or(())
            }
            OneshotTask::GetStats(tx) => tx.send(self.manager.stats()).unwrap_or(()),
            OneshotTask::GetLocalAddr(tx) => tx.send(self.socket.local_addr()).unwrap_or(()),
            OneshotTask::Shutdown => self.shutdown(),
        }
    }

    async fn handle_timeout(&mut self, task: ScheduledTask) {
        let queries = match task {
            ScheduledTask::RequestTimeout(trans_id) => self.handle_request_timeout(trans_id),
            ScheduledTask::RefreshNode(id) => self.manager.on_refresh_due(id, &mut self.timer),
            ScheduledTask::BootstrapStep => self.manager.bootstrap_step(&mut self.timer),
            ScheduledTask::LookupFanout(info_hash) => {
                self.lookups.on_fanout(info_hash, &mut self.timer)
            }
            ScheduledTask::LookupDeadline(info_hash) => {
                let now = self.clock.now();
                self.lookups.on_deadline(info_hash, now, &mut self.timer);
                Vec::new()
            }
        };

        self.send_queries(queries).await;
    }

    fn handle_request_timeout(&mut self, trans_id: TransactionId) -> Vec<OutgoingQuery> {
        let request = match self.transactions.expire(trans_id) {
            Some(request) => request,
            None => return Vec::new(),
        };

        log::trace!(
            "Request to {:?} ({:?}) timed out",
            request.contact,
            request.purpose
        );

        if request.purpose == Purpose::Probe {
            self.manager.probe_finished(request.contact.addr());
        }

        self.manager.on_timeout(request.contact, &mut self.timer)
    }

    async fn handle_check_health(
        &mut self,
        info_hash: InfoHash,
        timeout: Option<Duration>,
        tx: oneshot::Sender<Result<HealthResult, HealthError>>,
    ) {
        let now = self.clock.now();
        let timeout = timeout.unwrap_or(self.config.lookup_timeout);
        let closest: Vec<_> = self
            .manager
            .closest(&info_hash, self.config.bucket_size)
            .iter()
            .map(|node| *node.handle())
            .collect();

        let queries = self.lookups.start(
            info_hash,
            timeout,
            tx,
            &self.routers,
            &closest,
            now,
            &mut self.timer,
        );

        self.send_queries(queries).await;
    }

    async fn handle_incoming(&mut self, message: Message, addr: SocketAddr) {
        log::trace!("Received from {addr:?} {message:?}");

        let is_ns = message
            .version
            .as_deref()
            .map(|version| version.starts_with(NS_VERSION_PREFIX))
            .unwrap_or(false);

        match message.body {
            MessageBody::Request(request) => {
                self.handle_incoming_request(message.transaction_id, request, addr)
                    .await
            }
            MessageBody::Response(response) => {
                let request = match self.settle(&message.transaction_id, addr) {
                    Some(request) => request,
                    None => return,
                };

                self.handle_incoming_response(request, response, is_ns)
                    .await
            }
            MessageBody::Error(error) => {
                if let Some(request) = self.settle(&message.transaction_id, addr) {
                    log::debug!(
                        "Request to {:?} failed with error {}: {}",
                        request.contact,
                        error.code,
                        error.message
                    );

                    if request.purpose == Purpose::Probe {
                        self.manager.probe_finished(request.contact.addr());
                    }
                }
            }
        }
    }

    // Match an answer with the request it settles.
    fn settle(&mut self, transaction_id: &[u8], addr: SocketAddr) -> Option<PendingRequest> {
        let trans_id = match TransactionId::from_bytes(transaction_id) {
            Some(trans_id) => trans_id,
            None => {
                log::debug!("Received answer with invalid transaction id from {addr:?}");
                return None;
            }
        };

        let request = self.transactions.complete(trans_id, addr, &mut self.timer);

        if request.is_none() {
            log::debug!("Received unsolicited answer from {addr:?}");
        }

        request
    }

    async fn handle_incoming_request(
        &mut self,
        transaction_id: Vec<u8>,
        request: Request,
        addr: SocketAddr,
    ) {
        let now = self.clock.now();
        let sender = NodeHandle::new(request.sender_id(), addr);
        let queries = self
            .manager
            .on_query_received(sender, now, &mut self.timer);

        let node_id = self.manager.node_id();
        let response = match request {
            Request::Ping(_) => Response {
                id: node_id,
                ..Default::default()
            },
            Request::FindNode(FindNodeRequest { target, .. }) => Response {
                id: node_id,
                nodes: self.closest_ipv4(&target),
                ..Default::default()
            },
            // No peers are stored here, so only nodes are returned.
            Request::GetPeers(GetPeersRequest { info_hash, .. }) => Response {
                id: node_id,
                nodes: self.closest_ipv4(&info_hash),
                ..Default::default()
            },
        };

        let message = Message {
            transaction_id,
            version: Some(self.config.client_version.clone()),
            body: MessageBody::Response(response),
        };

        if let Err(error) = self.socket.send(&message, addr).await {
            log::debug!("Failed to answer {addr:?}: {}", error);
        }

        self.send_queries(queries).await;
    }

    async fn handle_incoming_response(
        &mut self,
        request: PendingRequest,
        response: Response,
        is_ns: bool,
    ) {
        let now = self.clock.now();
        let rtt = now.saturating_duration_since(request.sent_at);

        match request.contact {
            Contact::Node(node) if node.id == response.id => {
                self.manager
                    .on_response_received(node, Some(rtt), is_ns, now, &mut self.timer)
            }
            Contact::Node(node) => {
                log::debug!(
                    "Node at {:?} answered with id {:?}, expected {:?}",
                    node.addr,
                    response.id,
                    node.id
                );
            }
            Contact::Seed(_) => (),
        }

        if request.purpose == Purpose::Probe {
            self.manager.probe_finished(request.contact.addr());
        }

        let found: Vec<_> = response
            .nodes
            .iter()
            .filter(|node| node.addr.is_ipv4())
            .map(|node| (*node, is_ns))
            .collect();

        let mut queries = self.manager.on_nodes_found(&found);

        if let Purpose::Lookup(info_hash) = request.purpose {
            queries.extend(
                self.lookups
                    .on_response(info_hash, &response, now, &mut self.timer),
            );
        }

        self.send_queries(queries).await;
    }

    async fn send_queries(&mut self, queries: Vec<OutgoingQuery>) {
        for query in queries {
            self.send_query(query).await
        }
    }

    async fn send_query(&mut self, query: OutgoingQuery) {
        let now = self.clock.now();
        let trans_id = match self.transactions.start(
            query.contact,
            query.purpose,
            now,
            self.config.request_timeout,
            &mut self.timer,
        ) {
            Some(trans_id) => trans_id,
            None => {
                log::warn!("No free transaction id, dropping request");
                self.request_dropped(&query);
                return;
            }
        };

        let id = self.manager.node_id();
        let request = match query.query {
            Query::Ping => Request::Ping(PingRequest { id }),
            Query::FindNode(target) => Request::FindNode(FindNodeRequest { id, target }),
            Query::GetPeers(info_hash) => Request::GetPeers(GetPeersRequest {
                id,
                info_hash,
                noseed: true,
                scrape: true,
            }),
        };

        let message = Message {
            transaction_id: trans_id.to_bytes().to_vec(),
            version: Some(self.config.client_version.clone()),
            body: MessageBody::Request(request),
        };

        match self.socket.send(&message, query.contact.addr()).await {
            Ok(()) => (),
            // Lost on the wire as far as the routing policy is concerned.
            Err(RpcError::Io(error)) => {
                log::warn!("Failed to send to {:?}: {}", query.contact, error)
            }
            Err(error) => {
                log::debug!("Dropping request to {:?}: {}", query.contact, error);
                self.transactions.abort(trans_id, &mut self.timer);
                self.request_dropped(&query);
            }
        }
    }

    fn request_dropped(&mut self, query: &OutgoingQuery) {
        if query.purpose == Purpose::Probe {
            self.manager.probe_finished(query.contact.addr());
        }
    }

    fn closest_ipv4(&self, target: &NodeId) -> Vec<NodeHandle> {
        self.manager
            .closest(target, MAX_BUCKET_SIZE)
            .iter()
            .map(|node| *node.handle())
            .filter(|node| node.addr.is_ipv4())
            .collect()
    }

    fn shutdown(&mut self) {
        if !self.running {
            return;
        }

        log::info!(
            "Shutting down with {} requests in flight",
            self.transactions.len()
        );

        self.running = false;
        self.timer.clear();
        self.transactions.clear();
        self.lookups.cancel_all();
        self.command_rx.close();
    }
}
