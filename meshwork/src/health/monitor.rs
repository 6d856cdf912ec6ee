//! Peer health monitor.
//!
//! Requests from the dispatcher are posted onto an in-process bus. A relay
//! loop publishes them on the intercom address; the processing loop
//! subscribes to the intercom address and to every monitored peer's
//! heartbeat address, so peer heartbeats and local requests arrive on the
//! same socket and are handled one at a time.
//!
//! ```text
//! dispatcher ─post─> bus ─> relay ─pub─> intercom ─┐
//!                                                  ├─sub─> processing ─> dispatcher
//! peer heartbeat publishers ───────────────────────┘
//! ```
//!
//! Two timers post `CheckDeadPeers` and `CheckStalePeers` onto the bus.
//! The bus holds at most [`HEALTH_BUS_CAPACITY`] requests; requests posted
//! while it is full are dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Barrier, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::heartbeat::HeartbeatSender;
use super::registry::{bounded_heartbeat_interval, ClusterMemberMeta, PeerHealthRegistry};
use crate::config::{FabricConfig, HealthConfig};
use crate::error::{FabricError, MessageError};
use crate::identifier::{Node, NodeIdentity};
use crate::message::control::{
    AddPeer, CheckDeadPeers, CheckPeerConnection, CheckStalePeers, ControlKind, DeletePeer,
    Heartbeat, Ping, StartPeerMonitoring, UnregisterUnreachableNode,
};
use crate::message::{DistributionPattern, Message, Payload};
use crate::node::{Health, LocalNode};
use crate::security::SecurityProvider;
use crate::transport::{Socket, SocketFactory, SocketKind};

/// Pending requests the health bus holds before dropping new ones.
pub const HEALTH_BUS_CAPACITY: usize = 1024;

/// Liveness tracking of cluster peers.
#[async_trait]
pub trait ClusterHealthMonitor: Send + Sync {
    /// Start monitoring.
    async fn start(&self) -> Result<(), FabricError>;

    /// Stop monitoring.
    async fn stop(&self);

    /// Subscribe to `node`'s heartbeats; the dispatcher just connected to it.
    fn start_peer_monitoring(&self, node: Node, health: Health);

    /// Track `node` without subscribing to its heartbeats.
    fn add_peer(&self, node: Node, health: Health);

    /// Forget `node`.
    fn delete_peer(&self, node: &NodeIdentity);

    /// Probe connectivity to `node`.
    fn schedule_connectivity_check(&self, node: &NodeIdentity);
}

/// [`ClusterHealthMonitor`] for nodes running without a cluster.
#[derive(Debug, Default)]
pub struct StandaloneHealthMonitor;

#[async_trait]
impl ClusterHealthMonitor for StandaloneHealthMonitor {
    async fn start(&self) -> Result<(), FabricError> {
        Ok(())
    }

    async fn stop(&self) {}

    fn start_peer_monitoring(&self, _node: Node, _health: Health) {}

    fn add_peer(&self, _node: Node, _health: Health) {}

    fn delete_peer(&self, _node: &NodeIdentity) {}

    fn schedule_connectivity_check(&self, _node: &NodeIdentity) {}
}

struct Inner {
    registry: Arc<PeerHealthRegistry>,
    transport: Arc<dyn SocketFactory>,
    security: Arc<dyn SecurityProvider>,
    heartbeat: Arc<HeartbeatSender>,
    config: HealthConfig,
    dispatcher_address: String,
    shutdown_timeout: Duration,
    bus: mpsc::Sender<Message>,
    bus_rx: Mutex<mpsc::Receiver<Message>>,
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// [`ClusterHealthMonitor`] driven by peer heartbeats and probes.
pub struct PeerMonitor {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl PeerMonitor {
    /// Create a monitor; nothing runs until [`start`](ClusterHealthMonitor::start).
    pub fn new(
        config: &FabricConfig,
        transport: Arc<dyn SocketFactory>,
        security: Arc<dyn SecurityProvider>,
        local: Arc<LocalNode>,
    ) -> Self {
        let (bus, bus_rx) = mpsc::channel(HEALTH_BUS_CAPACITY);
        let heartbeat = Arc::new(HeartbeatSender::new(
            Arc::clone(&transport),
            local,
            config.health.heartbeat_address_range.clone(),
            config.health.heartbeat_interval,
        ));
        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(PeerHealthRegistry::new(&config.health)),
                transport,
                security,
                heartbeat,
                config: config.health.clone(),
                dispatcher_address: config.router.local_address.clone(),
                shutdown_timeout: config.router.shutdown_timeout,
                bus,
                bus_rx: Mutex::new(bus_rx),
            }),
            running: Mutex::new(None),
        }
    }

    /// The peer registry.
    pub fn registry(&self) -> &Arc<PeerHealthRegistry> {
        &self.inner.registry
    }
}

impl Inner {
    fn post<P: Payload>(&self, payload: &P) {
        match Message::create(payload, DistributionPattern::Unicast) {
            Ok(message) => match self.bus.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(message)) => {
                    warn!(request = %message.identifier(), "health bus full, dropping request");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => debug!("health bus closed"),
            },
            Err(e) => warn!(error = %e, "failed to build health request"),
        }
    }

    async fn relay(self: Arc<Self>, cancel: CancellationToken, barrier: Arc<Barrier>) {
        let mut publisher = self.transport.create_socket(SocketKind::Publisher, None);
        let bound = publisher.bind(&self.config.intercom_address);
        barrier.wait().await;
        if let Err(e) = bound {
            warn!(address = %self.config.intercom_address, error = %e, "health relay failed to bind");
            return;
        }

        let mut bus = tokio::select! {
            _ = cancel.cancelled() => return,
            bus = self.bus_rx.lock() => bus,
        };
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = bus.recv() => match next {
                    Some(message) => {
                        if let Err(e) = publisher.send(message).await {
                            warn!(error = %e, "health relay failed to publish");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("health relay stopped");
    }

    async fn process(self: Arc<Self>, cancel: CancellationToken, barrier: Arc<Barrier>) {
        let mut subscriber = self.transport.create_socket(SocketKind::Subscriber, None);
        let mut dispatcher = self.transport.create_socket(SocketKind::Dealer, None);
        let connected = subscriber
            .connect(&self.config.intercom_address)
            .and_then(|()| dispatcher.connect(&self.dispatcher_address));
        barrier.wait().await;
        if let Err(e) = connected {
            warn!(error = %e, "health processing loop failed to connect");
            return;
        }

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = subscriber.receive() => received,
            };
            match received {
                Ok(message) => {
                    if let Err(e) = self
                        .handle(message, subscriber.as_mut(), dispatcher.as_mut())
                        .await
                    {
                        warn!(error = %e, "failed to process health message");
                    }
                }
                Err(e) if e.is_closed() => {
                    warn!("health subscriber closed");
                    break;
                }
                Err(e) => warn!(error = %e, "health subscriber receive failed"),
            }
        }
        debug!("health processing loop stopped");
    }

    async fn handle(
        &self,
        message: Message,
        subscriber: &mut dyn Socket,
        dispatcher: &mut dyn Socket,
    ) -> Result<(), MessageError> {
        let now = Instant::now();
        match ControlKind::of(&message) {
            Some(ControlKind::Heartbeat) => {
                let heartbeat = message.payload::<Heartbeat>()?;
                if self.registry.update_last_heartbeat(&heartbeat.node_identity, now) {
                    trace!(node = %heartbeat.node_identity, "heartbeat received");
                }
            }
            Some(ControlKind::StartPeerMonitoring) => {
                let request = message.payload::<StartPeerMonitoring>()?;
                let meta = self.registry.find_or_add(
                    request.node.identity.clone(),
                    new_meta(&request.node, &request.health, now),
                );
                if !meta.connection_established {
                    match subscriber.connect(&meta.health_address) {
                        Ok(()) => {
                            self.registry
                                .set_connection_established(&request.node.identity, true);
                            self.registry
                                .update_last_heartbeat(&request.node.identity, now);
                            info!(node = %request.node, health = %meta.health_address, "monitoring peer");
                        }
                        Err(e) => {
                            warn!(node = %request.node, error = %e, "failed to subscribe to peer heartbeats")
                        }
                    }
                }
            }
            Some(ControlKind::AddPeer) => {
                let request = message.payload::<AddPeer>()?;
                self.registry.find_or_add(
                    request.node.identity.clone(),
                    new_meta(&request.node, &request.health, now),
                );
                debug!(node = %request.node, "peer added");
            }
            Some(ControlKind::DeletePeer) => {
                let request = message.payload::<DeletePeer>()?;
                self.forget(&request.node_identity, subscriber);
                debug!(node = %request.node_identity, "peer deleted");
            }
            Some(ControlKind::CheckDeadPeers) => {
                for (node, meta) in self.registry.peers_with_expired_heartbeat(now) {
                    warn!(
                        node = %node,
                        silent_for = ?now.saturating_duration_since(meta.last_known_heartbeat),
                        "peer missed heartbeats"
                    );
                    self.unregister(&node, subscriber, dispatcher).await;
                }
            }
            Some(ControlKind::CheckStalePeers) => {
                for (node, meta) in self.registry.stale_peers(now) {
                    self.check_connectivity(&node, &meta, subscriber, dispatcher).await;
                }
            }
            Some(ControlKind::CheckPeerConnection) => {
                let request = message.payload::<CheckPeerConnection>()?;
                if let Some(meta) = self.registry.find(&request.node_identity) {
                    self.check_connectivity(&request.node_identity, &meta, subscriber, dispatcher)
                        .await;
                }
            }
            kind => debug!(?kind, "unexpected health message"),
        }
        Ok(())
    }

    async fn check_connectivity(
        &self,
        node: &NodeIdentity,
        meta: &ClusterMemberMeta,
        subscriber: &mut dyn Socket,
        dispatcher: &mut dyn Socket,
    ) {
        match self.probe(node, &meta.scale_out_address).await {
            Ok(()) => {
                trace!(node = %node, "peer reachable");
                self.registry.update_last_heartbeat(node, Instant::now());
            }
            Err(e) => {
                warn!(node = %node, error = %e, "peer unreachable");
                self.unregister(node, subscriber, dispatcher).await;
            }
        }
    }

    async fn probe(&self, node: &NodeIdentity, address: &str) -> Result<(), FabricError> {
        let mut socket = self.transport.create_socket(SocketKind::Router, None);
        socket.connect(address)?;
        let mut ping = Message::create(
            &Ping {
                ping_id: rand::random(),
            },
            DistributionPattern::Unicast,
        )?;
        if let Some(domain) = self.security.allowed_domains().into_iter().next() {
            ping.set_domain(domain);
            ping.sign(self.security.as_ref())?;
        }
        ping.routing_identity = Some(node.as_bytes().to_vec());
        let sent = socket.send(ping).await;
        let _ = socket.disconnect(address);
        sent.map_err(FabricError::from)
    }

    fn forget(&self, node: &NodeIdentity, subscriber: &mut dyn Socket) {
        if let Some(meta) = self.registry.remove(node) {
            if meta.connection_established {
                if let Err(e) = subscriber.disconnect(&meta.health_address) {
                    debug!(node = %node, error = %e, "failed to unsubscribe from peer");
                }
            }
        }
    }

    async fn unregister(
        &self,
        node: &NodeIdentity,
        subscriber: &mut dyn Socket,
        dispatcher: &mut dyn Socket,
    ) {
        self.forget(node, subscriber);
        let request = Message::create(
            &UnregisterUnreachableNode {
                node_identity: node.clone(),
            },
            DistributionPattern::Unicast,
        );
        let result = match request {
            Ok(message) => dispatcher.send(message).await.map_err(FabricError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(node = %node, error = %e, "failed to request unreachable node unregistration");
        }
    }

    async fn sweep<P: Payload + Default>(
        self: Arc<Self>,
        cancel: CancellationToken,
        period: impl Fn(&Inner) -> Duration + Send,
    ) {
        loop {
            let delay = period(&self);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => self.post(&P::default()),
            }
        }
    }
}

fn new_meta(node: &Node, health: &Health, now: Instant) -> ClusterMemberMeta {
    ClusterMemberMeta {
        last_known_heartbeat: now,
        heartbeat_interval: bounded_heartbeat_interval(health.heartbeat_interval),
        health_address: health.address.clone(),
        scale_out_address: node.address.clone(),
        connection_established: false,
    }
}

#[async_trait]
impl ClusterHealthMonitor for PeerMonitor {
    async fn start(&self) -> Result<(), FabricError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let heartbeat_socket = self.inner.heartbeat.bind()?;
        let cancel = CancellationToken::new();
        let barrier = Arc::new(Barrier::new(3));
        let relay = tokio::spawn(
            Arc::clone(&self.inner).relay(cancel.clone(), Arc::clone(&barrier)),
        );
        let process = tokio::spawn(
            Arc::clone(&self.inner).process(cancel.clone(), Arc::clone(&barrier)),
        );
        barrier.wait().await;

        let heartbeat = tokio::spawn(
            Arc::clone(&self.inner.heartbeat).run(heartbeat_socket, cancel.clone()),
        );
        let dead = tokio::spawn(Arc::clone(&self.inner).sweep::<CheckDeadPeers>(
            cancel.clone(),
            |inner| {
                inner
                    .registry
                    .min_heartbeat_interval()
                    .unwrap_or(inner.config.heartbeat_interval)
            },
        ));
        let stale = tokio::spawn(Arc::clone(&self.inner).sweep::<CheckStalePeers>(
            cancel.clone(),
            |inner| inner.config.stale_peers_check_interval,
        ));

        *running = Some(Running {
            cancel,
            handles: vec![relay, process, heartbeat, dead, stale],
        });
        info!(intercom = %self.inner.config.intercom_address, "peer monitor started");
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        for handle in running.handles {
            if tokio::time::timeout(self.inner.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!("peer monitor task did not stop in time");
            }
        }
        info!("peer monitor stopped");
    }

    fn start_peer_monitoring(&self, node: Node, health: Health) {
        self.inner.post(&StartPeerMonitoring { node, health });
    }

    fn add_peer(&self, node: Node, health: Health) {
        self.inner.post(&AddPeer { node, health });
    }

    fn delete_peer(&self, node: &NodeIdentity) {
        self.inner.post(&DeletePeer {
            node_identity: node.clone(),
        });
    }

    fn schedule_connectivity_check(&self, node: &NodeIdentity) {
        self.inner.post(&CheckPeerConnection {
            node_identity: node.clone(),
        });
    }
}
