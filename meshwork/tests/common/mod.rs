//! Shared fixtures for cluster scenarios over the in-memory transport.
//!
//! A scenario runs one or more [`Fabric`] nodes against a [`Coordinator`]
//! stand-in: it pings its broadcast address like a rendezvous server,
//! records everything sent to its unicast address and can relay it to
//! every subscribed node.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshwork::message::control::{MessageContract, Ping, Pong, RegisterInternalMessageRoute};
use meshwork::{
    DistributionPattern, Fabric, FabricConfig, Identifier, InMemoryTransport, Message, Payload,
    ReceiverIdentifier, RendezvousEndpoint, SecurityProvider, SharedKeySecurityProvider, Socket,
    SocketFactory, SocketKind,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Application payload used by the scenarios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u32,
}

impl Payload for Order {
    const IDENTITY: &'static [u8] = b"ORDER";
}

/// Route key of [`Order`].
pub fn order_route() -> Identifier {
    Identifier::Message(Order::identifier())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn rdv(n: u16) -> RendezvousEndpoint {
    RendezvousEndpoint::new(format!("inproc://rdv-{n}-u"), format!("inproc://rdv-{n}-b"))
}

pub fn security() -> Arc<SharedKeySecurityProvider> {
    Arc::new(
        SharedKeySecurityProvider::single_domain("d", b"cluster-key".to_vec())
            .with_identity(Order::IDENTITY.to_vec(), "d"),
    )
}

/// A clustered node named `name` using the coordinators `servers`.
pub fn node(transport: &InMemoryTransport, name: &str, servers: Vec<RendezvousEndpoint>) -> Fabric {
    let config = FabricConfig::for_testing(name)
        .rendezvous_servers(servers)
        .build()
        .expect("config");
    Fabric::builder(config)
        .transport(Arc::new(transport.clone()))
        .security(security())
        .build()
        .expect("fabric")
}

/// Rendezvous server stand-in.
pub struct Coordinator {
    pub received: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Coordinator {
    /// Bind `endpoint`, ping every `ping_every` and, when `relay` is set,
    /// publish every control message it receives to all nodes.
    pub fn spawn(
        transport: &InMemoryTransport,
        endpoint: &RendezvousEndpoint,
        ping_every: Duration,
        relay: bool,
    ) -> Self {
        let mut unicast = transport.create_socket(SocketKind::Router, Some(b"rendezvous".to_vec()));
        unicast.bind(&endpoint.unicast).expect("bind unicast");
        let mut broadcast = transport.create_socket(SocketKind::Publisher, None);
        broadcast.bind(&endpoint.broadcast).expect("bind broadcast");

        let (tx, received) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_every);
            let mut ping_id = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        ping_id += 1;
                        let ping = Message::create(&Ping { ping_id }, DistributionPattern::Broadcast)
                            .expect("ping");
                        let _ = broadcast.send(ping).await;
                    }
                    received = unicast.receive() => {
                        let Ok(message) = received else { break };
                        if message.is::<Pong>() {
                            continue;
                        }
                        if relay {
                            let _ = broadcast.send(message.clone()).await;
                        }
                        let _ = tx.send(message);
                    }
                }
            }
        });
        Self {
            received,
            cancel,
            handle,
        }
    }

    /// Next control message matching `P`, skipping others.
    pub async fn next<P: Payload>(&mut self) -> Message {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(10), self.received.recv())
                .await
                .expect("coordinator message in time")
                .expect("coordinator running");
            if message.is::<P>() {
                return message;
            }
        }
    }

    /// Everything received within `window`.
    pub async fn drain(&mut self, window: Duration) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(Some(message)) = tokio::time::timeout(window, self.received.recv()).await {
            messages.push(message);
        }
        messages
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// A local receiver connected to `fabric`'s dispatcher.
pub struct Actor {
    pub identity: ReceiverIdentifier,
    pub socket: Box<dyn Socket>,
}

impl Actor {
    pub fn connect(transport: &InMemoryTransport, fabric: &Fabric, name: &str) -> Self {
        let identity = ReceiverIdentifier::new(format!("{}/{name}", fabric.local_node().identity()));
        let mut socket =
            transport.create_socket(SocketKind::Dealer, Some(identity.identity.clone()));
        socket
            .connect(fabric.router().local_address())
            .expect("connect actor");
        Self { identity, socket }
    }

    /// Register [`Order`] for this actor.
    pub async fn register_orders(&mut self, keep_local: bool) {
        let registration = Message::create(
            &RegisterInternalMessageRoute {
                receiver_identity: self.identity.clone(),
                routes: vec![MessageContract {
                    identifier: order_route(),
                    keep_local,
                }],
            },
            DistributionPattern::Unicast,
        )
        .expect("registration");
        self.socket.send(registration).await.expect("register");
    }

    /// Send a signed [`Order`].
    pub async fn send_order(&mut self, id: u32, distribution: DistributionPattern) {
        let mut message = Message::create(&Order { id }, distribution).expect("order");
        message.set_domain("d");
        let security: Arc<dyn SecurityProvider> = security();
        message.sign(security.as_ref()).expect("sign");
        self.socket.send(message).await.expect("send order");
    }

    pub async fn receive(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(10), self.socket.receive())
            .await
            .expect("message in time")
            .expect("receive")
    }

    /// Whether anything arrives within `window`.
    pub async fn receives_within(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.socket.receive())
            .await
            .is_ok()
    }
}

/// Poll `condition` until it holds or virtual time runs out.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
