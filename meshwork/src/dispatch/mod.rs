//! Message dispatcher.
//!
//! [`MessageRouter`] runs two loops:
//!
//! - the *scale-out* loop owns the socket peers send to. It verifies every
//!   inbound message and hands it to the local loop; a message that fails
//!   verification is answered with an [`Exception`](crate::message::control::Exception)
//!   along its callback route.
//! - the *local* loop owns the socket local receivers and fabric loops talk
//!   to, plus the socket used to forward to peers. It processes messages
//!   from both sources, one at a time.
//!
//! Processing a message:
//!
//! 1. service handlers get the first look; a handled message stops here.
//!    A handler failure is answered with an exception when the message
//!    carries a callback;
//! 2. local delivery: one receiver round-robin for unicast, every receiver
//!    for broadcast;
//! 3. remote forwarding: unicast when nothing local took it, broadcast only
//!    when it has not hopped yet; peers already in the hop trail are skipped,
//!    and a unicast walks the rotation until some peer accepts it;
//! 4. a message nobody took triggers route discovery.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use self::handlers::{service_handlers, ServiceMessageHandler};
use crate::config::FabricConfig;
use crate::discovery::ClusterMonitor;
use crate::error::FabricError;
use crate::health::ClusterHealthMonitor;
use crate::identifier::{Identifier, NodeIdentity, ReceiverIdentifier};
use crate::message::Message;
use crate::node::LocalNode;
use crate::routing::{ExternalRoutingTable, InternalRoutingTable, PeerConnection};
use crate::security::SecurityProvider;
use crate::transport::{bind_first_free, Socket, SocketFactory, SocketKind};

/// Where a message entered the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Local socket: local receivers, fabric loops, injected exceptions.
    Local,
    /// Scale-out socket: another node.
    Remote,
}

struct Inbound {
    message: Message,
    origin: Origin,
}

struct Inner {
    local: Arc<LocalNode>,
    transport: Arc<dyn SocketFactory>,
    security: Arc<dyn SecurityProvider>,
    cluster: Arc<dyn ClusterMonitor>,
    health: Arc<dyn ClusterHealthMonitor>,
    internal: Mutex<InternalRoutingTable>,
    external: Mutex<ExternalRoutingTable>,
    handlers: Vec<Box<dyn ServiceMessageHandler>>,
    local_address: String,
    scale_out_address_range: Vec<String>,
    connection_establish_wait: Duration,
    shutdown_timeout: Duration,
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Routes messages between local receivers and peers.
///
/// Owns the cluster monitor and the health monitor: [`start`](Self::start)
/// starts the health monitor, the dispatcher loops and then the cluster
/// monitor; [`stop`](Self::stop) stops them in reverse order.
pub struct MessageRouter {
    inner: Arc<Inner>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl MessageRouter {
    /// Create a dispatcher; nothing runs until [`start`](Self::start).
    pub fn new(
        config: &FabricConfig,
        local: Arc<LocalNode>,
        transport: Arc<dyn SocketFactory>,
        security: Arc<dyn SecurityProvider>,
        cluster: Arc<dyn ClusterMonitor>,
        health: Arc<dyn ClusterHealthMonitor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                transport,
                security,
                cluster,
                health,
                internal: Mutex::new(InternalRoutingTable::new()),
                external: Mutex::new(ExternalRoutingTable::new()),
                handlers: service_handlers(),
                local_address: config.router.local_address.clone(),
                scale_out_address_range: config.router.scale_out_address_range.clone(),
                connection_establish_wait: config.router.connection_establish_wait,
                shutdown_timeout: config.router.shutdown_timeout,
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Address local receivers connect to.
    pub fn local_address(&self) -> &str {
        &self.inner.local_address
    }

    /// Snapshot of the local routes.
    pub fn internal_routes(&self) -> Vec<(Identifier, Vec<ReceiverIdentifier>)> {
        self.inner.internal.lock().snapshot()
    }

    /// Snapshot of the routes to peers.
    pub fn external_routes(&self) -> Vec<(Identifier, Vec<NodeIdentity>)> {
        self.inner.external.lock().snapshot()
    }

    /// Start the health monitor, the dispatcher loops and the cluster monitor.
    ///
    /// Fails when the local address or every scale-out address is taken.
    pub async fn start(&self) -> Result<(), FabricError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        self.inner.health.start().await?;
        let (cancel, handles) = match self.inner.spawn_loops() {
            Ok(spawned) => spawned,
            Err(e) => {
                self.inner.health.stop().await;
                return Err(e);
            }
        };
        if let Err(e) = self.inner.cluster.start().await {
            cancel.cancel();
            self.inner.health.stop().await;
            return Err(e);
        }

        *running = Some(Running { cancel, handles });
        info!(
            node = %self.inner.local.identity(),
            local = %self.inner.local_address,
            scale_out = ?self.inner.local.scale_out_address(),
            "message router started"
        );
        Ok(())
    }

    /// Stop everything [`start`](Self::start) started.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.inner.cluster.stop().await;
        running.cancel.cancel();
        for handle in running.handles {
            if tokio::time::timeout(self.inner.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!("message router loop did not stop in time");
            }
        }
        self.inner.health.stop().await;
        info!(node = %self.inner.local.identity(), "message router stopped");
    }
}

/// Exception answering `message` along its callback route, if it has one.
fn exception_for(message: &Message, error: &dyn std::fmt::Display) -> Option<Message> {
    message.callback.as_ref()?;
    match Message::exception(message, error) {
        Ok(exception) => Some(exception),
        Err(e) => {
            warn!(message = %message.identifier(), error = %e, "failed to build exception");
            None
        }
    }
}

impl Inner {
    fn spawn_loops(self: &Arc<Self>) -> Result<(CancellationToken, Vec<JoinHandle<()>>), FabricError> {
        let mut local_socket = self.transport.create_socket(SocketKind::Router, None);
        local_socket.bind(&self.local_address)?;

        let mut scale_out = self.transport.create_socket(
            SocketKind::Router,
            Some(self.local.identity().as_bytes().to_vec()),
        );
        let address = bind_first_free(scale_out.as_mut(), &self.scale_out_address_range, "scale-out")?;
        self.local.set_scale_out_address(address);

        let sender = self.transport.create_socket(SocketKind::Router, None);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let receive = tokio::spawn(Arc::clone(self).scale_out_loop(scale_out, tx, cancel.clone()));
        let process = tokio::spawn(Arc::clone(self).local_loop(
            local_socket,
            sender,
            rx,
            cancel.clone(),
        ));
        Ok((cancel, vec![receive, process]))
    }

    async fn scale_out_loop(
        self: Arc<Self>,
        mut socket: Box<dyn Socket>,
        local: mpsc::UnboundedSender<Inbound>,
        cancel: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = socket.receive() => received,
            };
            let message = match received {
                Ok(message) => message,
                Err(e) if e.is_closed() => break,
                Err(e) => {
                    warn!(error = %e, "scale-out receive failed");
                    continue;
                }
            };
            let inbound = match message.verify(self.security.as_ref()) {
                Ok(()) => Inbound {
                    message,
                    origin: Origin::Remote,
                },
                Err(e) => {
                    warn!(
                        message = %message.identifier(),
                        domain = %message.domain,
                        error = %e,
                        "rejected message from peer"
                    );
                    match exception_for(&message, &e) {
                        Some(exception) => Inbound {
                            message: exception,
                            origin: Origin::Local,
                        },
                        None => continue,
                    }
                }
            };
            if local.send(inbound).is_err() {
                break;
            }
        }
        debug!("scale-out loop stopped");
    }

    async fn local_loop(
        self: Arc<Self>,
        mut local: Box<dyn Socket>,
        mut scale_out: Box<dyn Socket>,
        mut remote: mpsc::UnboundedReceiver<Inbound>,
        cancel: CancellationToken,
    ) {
        loop {
            let inbound = tokio::select! {
                _ = cancel.cancelled() => break,
                received = local.receive() => match received {
                    Ok(message) => Inbound { message, origin: Origin::Local },
                    Err(e) if e.is_closed() => break,
                    Err(e) => {
                        warn!(error = %e, "local receive failed");
                        continue;
                    }
                },
                received = remote.recv() => match received {
                    Some(inbound) => inbound,
                    None => break,
                },
            };
            self.process(local.as_mut(), scale_out.as_mut(), inbound).await;
        }
        debug!("local dispatch loop stopped");
    }

    async fn process(&self, local: &mut dyn Socket, scale_out: &mut dyn Socket, inbound: Inbound) {
        let Inbound { message, origin } = inbound;
        trace!(message = %message.identifier(), ?origin, hops = message.hop_count(), "dispatching");

        if let Some(handler) = self
            .handlers
            .iter()
            .find(|handler| handler.can_handle(&message, origin))
        {
            let failed = message.callback.is_some().then(|| message.clone());
            let identifier = message.identifier();
            if let Err(e) = handler.handle(self, scale_out, message).await {
                warn!(message = %identifier, error = %e, "service message failed");
                if let Some(exception) = failed.and_then(|original| exception_for(&original, &e)) {
                    self.route(local, scale_out, exception, Origin::Local).await;
                }
            }
            return;
        }
        self.route(local, scale_out, message, origin).await;
    }

    async fn route(
        &self,
        local: &mut dyn Socket,
        scale_out: &mut dyn Socket,
        message: Message,
        origin: Origin,
    ) {
        let key = message.routing_key();
        let handled_locally = self.deliver_locally(local, &message, &key).await;
        let forward = if message.is_broadcast() {
            message.hop_count() == 0
        } else {
            !handled_locally
        };
        let handled_remotely = forward && self.forward(scale_out, &message, &key).await;

        if handled_locally || handled_remotely {
            return;
        }
        debug!(route = %key, ?origin, "no route for message");
        self.cluster.discover_message_route(key.clone());
        if origin == Origin::Remote {
            if message.is_broadcast() {
                warn!(route = %key, "broadcast from peer has no local handler");
            }
            self.cluster.unregister_self(vec![key]);
        }
    }

    fn addressed_elsewhere(&self, message: &Message) -> bool {
        message
            .receiver_node_identity
            .as_ref()
            .is_some_and(|node| node != self.local.identity())
    }

    async fn deliver_locally(&self, socket: &mut dyn Socket, message: &Message, key: &Identifier) -> bool {
        if self.addressed_elsewhere(message) {
            return false;
        }
        let receivers: Vec<ReceiverIdentifier> = if message.is_broadcast() {
            self.internal.lock().find_all_routes(key)
        } else {
            self.internal.lock().find_route(key).into_iter().collect()
        };

        let mut delivered = false;
        for receiver in receivers {
            let mut copy = message.clone();
            copy.routing_identity = Some(receiver.identity.clone());
            match socket.send(copy).await {
                Ok(()) => {
                    trace!(receiver = %receiver, route = %key, "delivered locally");
                    delivered = true;
                }
                Err(e) if e.is_unreachable() => {
                    warn!(receiver = %receiver, error = %e, "local receiver unreachable, removing it");
                    let orphaned = self.internal.lock().remove_receiver(&receiver);
                    if !orphaned.is_empty() {
                        self.cluster.unregister_self(orphaned);
                    }
                }
                Err(e) => warn!(receiver = %receiver, error = %e, "local delivery failed"),
            }
        }
        delivered
    }

    fn may_forward_to(&self, message: &Message, peer: &PeerConnection) -> bool {
        let identity = &peer.node.identity;
        identity != self.local.identity()
            && !message.visited(identity)
            && message
                .receiver_node_identity
                .as_ref()
                .map_or(true, |target| target == identity)
    }

    async fn forward(&self, socket: &mut dyn Socket, message: &Message, key: &Identifier) -> bool {
        if message.is_broadcast() {
            let peers = self.external.lock().find_all_routes(key);
            let mut forwarded = false;
            for peer in peers {
                if self.may_forward_to(message, &peer) {
                    forwarded |= self.forward_to(socket, message, key, &peer).await;
                }
            }
            return forwarded;
        }

        // Unicast: walk the rotation until one eligible peer takes it.
        let mut tried: Vec<NodeIdentity> = Vec::new();
        loop {
            let next = self.external.lock().find_route_where(key, |peer| {
                !tried.contains(&peer.node.identity) && self.may_forward_to(message, peer)
            });
            let Some(peer) = next else {
                return false;
            };
            if self.forward_to(socket, message, key, &peer).await {
                return true;
            }
            tried.push(peer.node.identity);
        }
    }

    async fn forward_to(
        &self,
        socket: &mut dyn Socket,
        message: &Message,
        key: &Identifier,
        peer: &PeerConnection,
    ) -> bool {
        if !peer.connected && !self.connect(socket, peer).await {
            return false;
        }
        let mut copy = message.clone();
        copy.push_hop(self.local.node());
        copy.routing_identity = Some(peer.node.identity.as_bytes().to_vec());
        match socket.send(copy).await {
            Ok(()) => {
                trace!(node = %peer.node, route = %key, "forwarded");
                true
            }
            Err(e) => {
                warn!(node = %peer.node, route = %key, error = %e, "forwarding failed, dropping peer");
                self.drop_peer(socket, &peer.node.identity);
                false
            }
        }
    }

    async fn connect(&self, socket: &mut dyn Socket, peer: &PeerConnection) -> bool {
        if let Err(e) = socket.connect(&peer.node.address) {
            warn!(node = %peer.node, error = %e, "failed to connect to peer");
            self.drop_peer(socket, &peer.node.identity);
            return false;
        }
        tokio::time::sleep(self.connection_establish_wait).await;
        self.external.lock().mark_connected(&peer.node.identity);
        self.health
            .start_peer_monitoring(peer.node.clone(), peer.health.clone());
        debug!(node = %peer.node, "connected to peer");
        true
    }

    fn drop_peer(&self, socket: &mut dyn Socket, node: &NodeIdentity) {
        let removed = self.external.lock().remove_node_route(node);
        if let Some(peer) = removed {
            self.release(socket, &peer);
        }
        self.health.delete_peer(node);
    }

    fn release(&self, socket: &mut dyn Socket, peer: &PeerConnection) {
        if peer.connected {
            if let Err(e) = socket.disconnect(&peer.node.address) {
                debug!(node = %peer.node, error = %e, "failed to disconnect from peer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::discovery::StandaloneClusterMonitor;
    use crate::health::StandaloneHealthMonitor;
    use crate::identifier::{MessageIdentifier, Node};
    use crate::message::control::{
        Exception, MessageContract, RegisterExternalMessageRoute, RegisterInternalMessageRoute,
    };
    use crate::message::{CallbackRoute, DistributionPattern, Payload};
    use crate::node::Health;
    use crate::security::SharedKeySecurityProvider;
    use crate::transport::InMemoryTransport;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    impl Payload for Order {
        const IDENTITY: &'static [u8] = b"ORDER";
    }

    fn order_route() -> Identifier {
        Identifier::Message(Order::identifier())
    }

    fn security() -> Arc<SharedKeySecurityProvider> {
        Arc::new(
            SharedKeySecurityProvider::single_domain("d", b"k".to_vec())
                .with_identity(b"ORDER".to_vec(), "d"),
        )
    }

    #[derive(Debug, Default)]
    struct RecordingClusterMonitor {
        discovered: Mutex<Vec<Identifier>>,
        unregistered: Mutex<Vec<Identifier>>,
    }

    #[async_trait::async_trait]
    impl ClusterMonitor for RecordingClusterMonitor {
        async fn start(&self) -> Result<(), FabricError> {
            Ok(())
        }

        async fn stop(&self) {}

        fn register_self(&self, _routes: Vec<Identifier>, _domain: &str) {}

        fn unregister_self(&self, routes: Vec<Identifier>) {
            self.unregistered.lock().extend(routes);
        }

        fn request_cluster_routes(&self) {}

        fn discover_message_route(&self, route: Identifier) {
            self.discovered.lock().push(route);
        }
    }

    async fn router(transport: &InMemoryTransport) -> MessageRouter {
        router_with(transport, Arc::new(StandaloneClusterMonitor)).await
    }

    async fn router_with(transport: &InMemoryTransport, cluster: Arc<dyn ClusterMonitor>) -> MessageRouter {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
        let config = FabricConfig::for_testing("me")
            .standalone(true)
            .build()
            .expect("config");
        let router = MessageRouter::new(
            &config,
            Arc::new(LocalNode::new(NodeIdentity::new(b"me".to_vec()))),
            Arc::new(transport.clone()),
            security(),
            cluster,
            Arc::new(StandaloneHealthMonitor),
        );
        router.start().await.expect("start");
        router
    }

    /// A node's view of this router's scale-out socket.
    fn peer(transport: &InMemoryTransport, name: &str) -> Box<dyn Socket> {
        let mut socket = transport.create_socket(SocketKind::Dealer, Some(name.as_bytes().to_vec()));
        socket.connect("inproc://me/scaleout-0").expect("connect");
        socket
    }

    fn peer_node(name: &str) -> Node {
        Node::new(
            NodeIdentity::new(name.as_bytes().to_vec()),
            format!("inproc://{name}/scaleout-0"),
        )
    }

    fn signed(mut message: Message) -> Message {
        message.set_domain("d");
        message.sign(security().as_ref()).expect("sign");
        message
    }

    fn peer_registration(name: &str) -> Message {
        signed(
            Message::create(
                &RegisterExternalMessageRoute {
                    node: peer_node(name),
                    health: Health {
                        address: format!("inproc://{name}/heartbeat-0"),
                        heartbeat_interval: Duration::from_millis(100),
                    },
                    routes: vec![order_route()],
                },
                DistributionPattern::Unicast,
            )
            .expect("create"),
        )
    }

    fn actor(transport: &InMemoryTransport, name: &[u8]) -> Box<dyn Socket> {
        let mut socket = transport.create_socket(SocketKind::Dealer, Some(name.to_vec()));
        socket.connect("inproc://me/router").expect("connect");
        socket
    }

    async fn register(actor: &mut dyn Socket, name: &[u8], keep_local: bool) {
        let registration = Message::create(
            &RegisterInternalMessageRoute {
                receiver_identity: ReceiverIdentifier::new(name.to_vec()),
                routes: vec![MessageContract {
                    identifier: order_route(),
                    keep_local,
                }],
            },
            DistributionPattern::Unicast,
        )
        .expect("create");
        actor.send(registration).await.expect("send");
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    async fn receive(socket: &mut dyn Socket) -> Message {
        tokio::time::timeout(Duration::from_secs(5), socket.receive())
            .await
            .expect("in time")
            .expect("receive")
    }

    #[tokio::test]
    async fn test_start_binds_local_and_scale_out() {
        let transport = InMemoryTransport::new();
        let router = router(&transport).await;
        assert!(transport.is_bound("inproc://me/router"));
        assert!(transport.is_bound("inproc://me/scaleout-0"));
        router.stop().await;
        assert!(!transport.is_bound("inproc://me/router"));
        assert!(!transport.is_bound("inproc://me/scaleout-0"));
    }

    #[tokio::test]
    async fn test_scale_out_range_exhausted_is_fatal() {
        let transport = InMemoryTransport::new();
        let mut squatters = Vec::new();
        for i in 0..3 {
            let mut socket = transport.create_socket(SocketKind::Router, None);
            socket
                .bind(&format!("inproc://me/scaleout-{i}"))
                .expect("bind");
            squatters.push(socket);
        }
        let config = FabricConfig::for_testing("me")
            .standalone(true)
            .build()
            .expect("config");
        let router = MessageRouter::new(
            &config,
            Arc::new(LocalNode::new(NodeIdentity::new(b"me".to_vec()))),
            Arc::new(transport.clone()),
            security(),
            Arc::new(StandaloneClusterMonitor),
            Arc::new(StandaloneHealthMonitor),
        );
        let err = router.start().await.expect_err("range taken");
        assert!(matches!(err, FabricError::BindRangeExhausted { .. }));
    }

    #[tokio::test]
    async fn test_unicast_round_robin_between_local_receivers() {
        let transport = InMemoryTransport::new();
        let router = router(&transport).await;
        let mut a = actor(&transport, b"A");
        let mut b = actor(&transport, b"B");
        register(a.as_mut(), b"A", false).await;
        register(b.as_mut(), b"B", false).await;
        assert!(eventually(|| router
            .internal_routes()
            .first()
            .is_some_and(|(_, receivers)| receivers.len() == 2))
        .await);

        let mut client = actor(&transport, b"client");
        for id in 0..3 {
            let order = Message::create(&Order { id }, DistributionPattern::Unicast).expect("create");
            client.send(order).await.expect("send");
        }
        assert_eq!(receive(a.as_mut()).await.payload::<Order>().expect("decode").id, 0);
        assert_eq!(receive(b.as_mut()).await.payload::<Order>().expect("decode").id, 1);
        assert_eq!(receive(a.as_mut()).await.payload::<Order>().expect("decode").id, 2);
        router.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_local_receiver() {
        let transport = InMemoryTransport::new();
        let router = router(&transport).await;
        let mut a = actor(&transport, b"A");
        let mut b = actor(&transport, b"B");
        register(a.as_mut(), b"A", false).await;
        register(b.as_mut(), b"B", true).await;
        assert!(eventually(|| router
            .internal_routes()
            .first()
            .is_some_and(|(_, receivers)| receivers.len() == 2))
        .await);

        let mut client = actor(&transport, b"client");
        let order = Message::create(&Order { id: 7 }, DistributionPattern::Broadcast).expect("create");
        client.send(order).await.expect("send");
        assert!(receive(a.as_mut()).await.is::<Order>());
        assert!(receive(b.as_mut()).await.is::<Order>());
        router.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_receiver_is_removed() {
        let transport = InMemoryTransport::new();
        let router = router(&transport).await;
        let mut a = actor(&transport, b"A");
        register(a.as_mut(), b"A", false).await;
        assert!(eventually(|| !router.internal_routes().is_empty()).await);
        drop(a);

        let mut client = actor(&transport, b"client");
        let order = Message::create(&Order { id: 1 }, DistributionPattern::Unicast).expect("create");
        client.send(order).await.expect("send");
        assert!(eventually(|| router.internal_routes().is_empty()).await);
        router.stop().await;
    }

    #[tokio::test]
    async fn test_external_registration_requires_valid_signature() {
        let transport = InMemoryTransport::new();
        let router = router(&transport).await;
        let mut coordinator = actor(&transport, b"listener");
        let registration = |domain: &str| {
            let mut message = Message::create(
                &RegisterExternalMessageRoute {
                    node: Node::new(NodeIdentity::new(b"peer".to_vec()), "inproc://peer/scaleout-0"),
                    health: Health {
                        address: "inproc://peer/heartbeat-0".to_string(),
                        heartbeat_interval: Duration::from_millis(100),
                    },
                    routes: vec![order_route()],
                },
                DistributionPattern::Unicast,
            )
            .expect("create");
            message.set_domain(domain);
            message
        };

        let mut forged = registration("d");
        forged.signature = b"forged".to_vec();
        coordinator.send(forged).await.expect("send");

        let mut signed = registration("d");
        signed.sign(security().as_ref()).expect("sign");
        coordinator.send(signed).await.expect("send");

        assert!(eventually(|| !router.external_routes().is_empty()).await);
        assert_eq!(
            router.external_routes(),
            vec![(order_route(), vec![NodeIdentity::new(b"peer".to_vec())])]
        );
        router.stop().await;
    }

    #[tokio::test]
    async fn test_message_for_another_node_skips_local_receivers() {
        let transport = InMemoryTransport::new();
        let router = router(&transport).await;
        let mut a = actor(&transport, b"A");
        register(a.as_mut(), b"A", false).await;
        assert!(eventually(|| !router.internal_routes().is_empty()).await);

        let mut client = actor(&transport, b"client");
        let mut elsewhere = Message::create(&Order { id: 1 }, DistributionPattern::Unicast).expect("create");
        elsewhere.receiver_node_identity = Some(NodeIdentity::new(b"other".to_vec()));
        client.send(elsewhere).await.expect("send");
        let here = Message::create(&Order { id: 2 }, DistributionPattern::Unicast).expect("create");
        client.send(here).await.expect("send");

        assert_eq!(receive(a.as_mut()).await.payload::<Order>().expect("decode").id, 2);
        assert_eq!(
            router.internal_routes(),
            vec![(
                Identifier::Message(MessageIdentifier::new(b"ORDER".to_vec(), 1, Vec::new())),
                vec![ReceiverIdentifier::new(b"A".to_vec())]
            )]
        );
        router.stop().await;
    }

    #[tokio::test]
    async fn test_failed_service_message_answers_callback() {
        let transport = InMemoryTransport::new();
        let router = router(&transport).await;
        let mut caller = actor(&transport, b"caller");
        let registration = Message::create(
            &RegisterInternalMessageRoute {
                receiver_identity: ReceiverIdentifier::new(b"caller".to_vec()),
                routes: vec![MessageContract {
                    identifier: Identifier::Receiver(ReceiverIdentifier::new(b"caller".to_vec())),
                    keep_local: true,
                }],
            },
            DistributionPattern::Unicast,
        )
        .expect("create");
        caller.send(registration).await.expect("send");
        assert!(eventually(|| !router.internal_routes().is_empty()).await);

        let mut malformed = peer_registration("peer");
        malformed.body = b"not a registration".to_vec();
        malformed.callback = Some(CallbackRoute {
            receiver_identity: ReceiverIdentifier::new(b"caller".to_vec()),
            receiver_node_identity: None,
            points: Vec::new(),
            key: 42,
        });
        let mut sender = peer(&transport, "peer");
        sender.send(signed(malformed)).await.expect("send");

        let exception = receive(caller.as_mut()).await;
        assert!(exception.is::<Exception>());
        assert_eq!(exception.callback.map(|callback| callback.key), Some(42));
        assert!(router.external_routes().is_empty());
        router.stop().await;
    }

    #[tokio::test]
    async fn test_unhandled_remote_message_withdraws_route() {
        let transport = InMemoryTransport::new();
        let cluster = Arc::new(RecordingClusterMonitor::default());
        let router = router_with(&transport, Arc::clone(&cluster) as Arc<dyn ClusterMonitor>).await;

        let mut sender = peer(&transport, "peer");
        let order = Message::create(&Order { id: 1 }, DistributionPattern::Unicast).expect("create");
        sender.send(signed(order)).await.expect("send");

        assert!(eventually(|| !cluster.unregistered.lock().is_empty()).await);
        assert_eq!(*cluster.unregistered.lock(), vec![order_route()]);
        assert_eq!(*cluster.discovered.lock(), vec![order_route()]);
        router.stop().await;
    }

    #[tokio::test]
    async fn test_unhandled_local_message_only_discovers() {
        let transport = InMemoryTransport::new();
        let cluster = Arc::new(RecordingClusterMonitor::default());
        let router = router_with(&transport, Arc::clone(&cluster) as Arc<dyn ClusterMonitor>).await;

        let mut client = actor(&transport, b"client");
        let order = Message::create(&Order { id: 1 }, DistributionPattern::Unicast).expect("create");
        client.send(order).await.expect("send");

        assert!(eventually(|| !cluster.discovered.lock().is_empty()).await);
        assert_eq!(*cluster.discovered.lock(), vec![order_route()]);
        assert!(cluster.unregistered.lock().is_empty());
        router.stop().await;
    }

    #[tokio::test]
    async fn test_unicast_skips_visited_peer_for_next_candidate() {
        let transport = InMemoryTransport::new();
        let router = router(&transport).await;
        let mut nodes = Vec::new();
        for name in ["pa", "pb"] {
            let mut socket = transport.create_socket(SocketKind::Router, Some(name.as_bytes().to_vec()));
            socket
                .bind(&format!("inproc://{name}/scaleout-0"))
                .expect("bind");
            nodes.push(socket);
        }
        let mut listener = actor(&transport, b"listener");
        listener.send(peer_registration("pa")).await.expect("send");
        listener.send(peer_registration("pb")).await.expect("send");
        assert!(eventually(|| router.external_routes()
            == vec![(
                order_route(),
                vec![
                    NodeIdentity::new(b"pa".to_vec()),
                    NodeIdentity::new(b"pb".to_vec())
                ]
            )])
        .await);

        let mut order = Message::create(&Order { id: 5 }, DistributionPattern::Unicast).expect("create");
        order.hops = vec![peer_node("pa")];
        let mut sender = peer(&transport, "pa");
        sender.send(signed(order)).await.expect("send");

        let forwarded = receive(nodes[1].as_mut()).await;
        assert_eq!(forwarded.payload::<Order>().expect("decode").id, 5);
        assert_eq!(forwarded.hops, vec![peer_node("pa"), router.inner.local.node()]);
        let nothing = tokio::time::timeout(Duration::from_millis(100), nodes[0].receive()).await;
        assert!(nothing.is_err());
        router.stop().await;
    }
}
