//! Cluster discovery.
//!
//! The [`ClusterMonitor`] is the dispatcher's view of the cluster: it
//! announces this node's routes to the current rendezvous coordinator,
//! withdraws them, and asks who handles unknown routes.
//!
//! [`ClusterMonitorService`] composes the discovery channel
//! ([`DiscoveryMessageSender`] + [`DiscoveryMessageListener`]) and the
//! [`RouteDiscoveryThrottle`]. Its supervisor rebuilds the channel whenever
//! the listener asks for a restart (coordinator failover, leader change,
//! reconfiguration) and re-announces every registered route to the new
//! coordinator. [`StandaloneClusterMonitor`] does nothing and is used when
//! the node runs without a cluster.

pub mod listener;
pub mod sender;
pub mod throttle;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, Barrier};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use listener::{DiscoveryMessageListener, RestartRequest};
pub use sender::DiscoveryMessageSender;
pub use throttle::RouteDiscoveryThrottle;

use crate::config::FabricConfig;
use crate::error::FabricError;
use crate::identifier::Identifier;
use crate::message::control::{
    RegisterExternalMessageRoute, RequestClusterMessageRoutes, UnregisterMessageRoute,
};
use crate::message::{DistributionPattern, Message, Payload};
use crate::node::{Health, LocalNode};
use crate::rendezvous::RendezvousDirectory;
use crate::security::{group_by_domain, SecurityProvider};
use crate::transport::SocketFactory;

/// Cluster membership and route announcement.
#[async_trait]
pub trait ClusterMonitor: Send + Sync {
    /// Start the discovery loops.
    async fn start(&self) -> Result<(), FabricError>;

    /// Stop the discovery loops.
    async fn stop(&self);

    /// Announce that this node handles `routes` in `domain`.
    fn register_self(&self, routes: Vec<Identifier>, domain: &str);

    /// Withdraw `routes` from the cluster.
    fn unregister_self(&self, routes: Vec<Identifier>);

    /// Ask every node to re-announce its routes.
    fn request_cluster_routes(&self);

    /// Ask the cluster who handles `route`.
    fn discover_message_route(&self, route: Identifier);
}

/// [`ClusterMonitor`] for nodes running without a cluster.
#[derive(Debug, Default)]
pub struct StandaloneClusterMonitor;

#[async_trait]
impl ClusterMonitor for StandaloneClusterMonitor {
    async fn start(&self) -> Result<(), FabricError> {
        Ok(())
    }

    async fn stop(&self) {}

    fn register_self(&self, _routes: Vec<Identifier>, _domain: &str) {}

    fn unregister_self(&self, _routes: Vec<Identifier>) {}

    fn request_cluster_routes(&self) {}

    fn discover_message_route(&self, _route: Identifier) {}
}

struct Inner {
    local: Arc<LocalNode>,
    security: Arc<dyn SecurityProvider>,
    sender: Arc<DiscoveryMessageSender>,
    listener: Arc<DiscoveryMessageListener>,
    throttle: Arc<RouteDiscoveryThrottle>,
    announced: Mutex<BTreeMap<String, BTreeSet<Identifier>>>,
    heartbeat_interval: Duration,
    auto_discovery_delay: Duration,
    auto_discovery_max_multiplier: u32,
    shutdown_timeout: Duration,
}

/// Sender and listener loops of one connection to a coordinator.
struct Loops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
    throttle: JoinHandle<()>,
    auto_discovery: JoinHandle<()>,
}

/// [`ClusterMonitor`] talking to rendezvous coordinators.
pub struct ClusterMonitorService {
    inner: Arc<Inner>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl ClusterMonitorService {
    /// Create the service and its discovery channel.
    pub fn new(
        config: &FabricConfig,
        directory: Arc<RendezvousDirectory>,
        transport: Arc<dyn SocketFactory>,
        security: Arc<dyn SecurityProvider>,
        local: Arc<LocalNode>,
    ) -> Self {
        let sender = Arc::new(DiscoveryMessageSender::new(
            Arc::clone(&directory),
            Arc::clone(&transport),
            Arc::clone(&local),
            config.discovery.max_discovery_sender_queue_length,
        ));
        let listener = Arc::new(DiscoveryMessageListener::new(
            directory,
            transport,
            Arc::clone(&sender),
            Arc::clone(&security),
            Arc::clone(&local),
            config.router.local_address.clone(),
            config.cluster_membership.heartbeat_silence_before_failover,
        ));
        let throttle = Arc::new(RouteDiscoveryThrottle::new(
            &config.discovery,
            Arc::clone(&sender),
            Arc::clone(&security),
            Arc::clone(&local),
        ));
        Self {
            inner: Arc::new(Inner {
                local,
                security,
                sender,
                listener,
                throttle,
                announced: Mutex::new(BTreeMap::new()),
                heartbeat_interval: config.health.heartbeat_interval,
                auto_discovery_delay: config.cluster_auto_discovery.start_delay,
                auto_discovery_max_multiplier: config
                    .cluster_auto_discovery
                    .start_delay_max_multiplier,
                shutdown_timeout: config.router.shutdown_timeout,
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// The outbound discovery queue.
    pub fn sender(&self) -> &Arc<DiscoveryMessageSender> {
        &self.inner.sender
    }

    /// The route-discovery throttle.
    pub fn throttle(&self) -> &Arc<RouteDiscoveryThrottle> {
        &self.inner.throttle
    }

    /// Routes currently announced, per domain.
    pub fn announced_routes(&self) -> Vec<(String, Vec<Identifier>)> {
        self.inner
            .announced
            .lock()
            .iter()
            .map(|(domain, routes)| (domain.clone(), routes.iter().cloned().collect()))
            .collect()
    }
}

impl Inner {
    async fn start_loops(&self, restart: RestartRequest) -> Loops {
        let cancel = CancellationToken::new();
        let barrier = Arc::new(Barrier::new(3));
        let sender = tokio::spawn(
            Arc::clone(&self.sender).run(cancel.clone(), Arc::clone(&barrier)),
        );
        let listener = tokio::spawn(Arc::clone(&self.listener).run(
            restart,
            cancel.clone(),
            Arc::clone(&barrier),
        ));
        barrier.wait().await;
        Loops {
            cancel,
            handles: vec![sender, listener],
        }
    }

    async fn stop_loops(&self, loops: Loops) {
        loops.cancel.cancel();
        for handle in loops.handles {
            match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "discovery loop ended abnormally"),
                Err(_) => warn!(timeout = ?self.shutdown_timeout, "discovery loop did not stop in time"),
            }
        }
    }

    fn health(&self) -> Health {
        self.local.health().unwrap_or(Health {
            address: String::new(),
            heartbeat_interval: self.heartbeat_interval,
        })
    }

    fn send_signed<P: Payload>(&self, payload: &P, domain: &str) {
        let mut message = match Message::create(payload, DistributionPattern::Unicast) {
            Ok(message) => message,
            Err(e) => {
                warn!(domain, error = %e, "failed to build discovery message");
                return;
            }
        };
        message.set_domain(domain);
        if let Err(e) = message.sign(self.security.as_ref()) {
            warn!(domain, error = %e, "failed to sign discovery message");
            return;
        }
        if !self.sender.enqueue(message) {
            debug!(domain, "discovery queue full, message dropped");
        }
    }

    fn announce(&self, routes: Vec<Identifier>, domain: &str) {
        debug!(count = routes.len(), domain, "registering routes with cluster");
        self.send_signed(
            &RegisterExternalMessageRoute {
                node: self.local.node(),
                health: self.health(),
                routes,
            },
            domain,
        );
    }

    fn announce_all(&self) {
        let announced: Vec<(String, Vec<Identifier>)> = self
            .announced
            .lock()
            .iter()
            .map(|(domain, routes)| (domain.clone(), routes.iter().cloned().collect()))
            .collect();
        for (domain, routes) in announced {
            self.announce(routes, &domain);
        }
    }

    fn request_cluster_routes(&self) {
        let requestor = self.local.node();
        for domain in self.security.allowed_domains() {
            self.send_signed(
                &RequestClusterMessageRoutes {
                    requestor: requestor.clone(),
                },
                &domain,
            );
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    mut loops: Loops,
    mut restarts: mpsc::UnboundedReceiver<()>,
    restart: RestartRequest,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = restarts.recv() => {
                if request.is_none() {
                    break;
                }
                while restarts.try_recv().is_ok() {}
                info!("restarting cluster monitor");
                inner.stop_loops(loops).await;
                loops = inner.start_loops(Arc::clone(&restart)).await;
                inner.announce_all();
            }
        }
    }
    inner.stop_loops(loops).await;
}

#[async_trait]
impl ClusterMonitor for ClusterMonitorService {
    async fn start(&self) -> Result<(), FabricError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let restart: RestartRequest = Arc::new(move || {
            let _ = tx.send(());
        });

        let loops = self.inner.start_loops(Arc::clone(&restart)).await;
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            loops,
            rx,
            restart,
            cancel.clone(),
        ));
        let throttle = tokio::spawn(Arc::clone(&self.inner.throttle).run(cancel.clone()));

        let multiplier = rand::thread_rng().gen_range(1..=self.inner.auto_discovery_max_multiplier.max(1));
        let delay = self.inner.auto_discovery_delay * multiplier;
        let inner = Arc::clone(&self.inner);
        let auto_cancel = cancel.clone();
        let auto_discovery = tokio::spawn(async move {
            tokio::select! {
                _ = auto_cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    debug!(delay = ?delay, "requesting cluster routes");
                    inner.request_cluster_routes();
                }
            }
        });

        *running = Some(Running {
            cancel,
            supervisor,
            throttle,
            auto_discovery,
        });
        info!(node = %self.inner.local.identity(), "cluster monitor started");
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        let timeout = self.inner.shutdown_timeout * 2;
        for (name, handle) in [
            ("supervisor", running.supervisor),
            ("throttle", running.throttle),
            ("auto discovery", running.auto_discovery),
        ] {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(task = name, "cluster monitor task did not stop in time");
            }
        }
        info!(node = %self.inner.local.identity(), "cluster monitor stopped");
    }

    fn register_self(&self, routes: Vec<Identifier>, domain: &str) {
        if routes.is_empty() {
            return;
        }
        self.inner
            .announced
            .lock()
            .entry(domain.to_string())
            .or_default()
            .extend(routes.iter().cloned());
        self.inner.announce(routes, domain);
    }

    fn unregister_self(&self, routes: Vec<Identifier>) {
        let node = self.inner.local.node();
        for (domain, routes) in group_by_domain(self.inner.security.as_ref(), routes) {
            {
                let mut announced = self.inner.announced.lock();
                if let Some(registered) = announced.get_mut(&domain) {
                    for route in &routes {
                        registered.remove(route);
                    }
                    if registered.is_empty() {
                        announced.remove(&domain);
                    }
                }
            }
            debug!(count = routes.len(), domain = %domain, "unregistering routes from cluster");
            self.inner.send_signed(
                &UnregisterMessageRoute {
                    node: node.clone(),
                    routes,
                },
                &domain,
            );
        }
    }

    fn request_cluster_routes(&self) {
        self.inner.request_cluster_routes();
    }

    fn discover_message_route(&self, route: Identifier) {
        self.inner.throttle.request_discovery(route);
    }
}
