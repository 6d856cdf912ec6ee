//! In-process transport.
//!
//! All sockets created from one [`InMemoryTransport`] share a hub that
//! tracks bindings and connections and routes messages through unbounded
//! channels. Binds, connects, disconnects and closes are recorded so tests
//! can assert on socket lifecycle; only the last [`MAX_RECORDED_EVENTS`]
//! are kept.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{Socket, SocketFactory, SocketKind};
use crate::error::TransportError;
use crate::identifier::display_identity;
use crate::message::Message;

/// Lifecycle events kept by the hub; older ones are discarded.
pub const MAX_RECORDED_EVENTS: usize = 4096;

/// Lifecycle action recorded by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketAction {
    /// Socket bound an address.
    Bind,
    /// Socket connected to an address.
    Connect,
    /// Socket disconnected from an address.
    Disconnect,
    /// Socket was dropped while bound or connected to an address.
    Close,
}

/// A recorded socket lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEvent {
    /// Hub-local socket id.
    pub socket: u64,
    /// Kind of the socket.
    pub kind: SocketKind,
    /// Routing identity of the socket.
    pub identity: Option<Vec<u8>>,
    /// What happened.
    pub action: SocketAction,
    /// Address involved.
    pub address: String,
}

struct Endpoint {
    kind: SocketKind,
    identity: Option<Vec<u8>>,
    inbox: mpsc::UnboundedSender<Message>,
    bound: HashSet<String>,
    connected: HashSet<String>,
}

#[derive(Default)]
struct Hub {
    sockets: HashMap<u64, Endpoint>,
    bindings: HashMap<String, u64>,
    events: VecDeque<SocketEvent>,
    next_id: u64,
}

impl Hub {
    fn record(&mut self, socket: u64, action: SocketAction, address: &str) {
        if let Some(endpoint) = self.sockets.get(&socket) {
            if self.events.len() == MAX_RECORDED_EVENTS {
                self.events.pop_front();
            }
            self.events.push_back(SocketEvent {
                socket,
                kind: endpoint.kind,
                identity: endpoint.identity.clone(),
                action,
                address: address.to_string(),
            });
        }
    }

    fn publish(&self, from: u64, message: &Message) {
        let Some(publisher) = self.sockets.get(&from) else {
            return;
        };
        for (id, endpoint) in &self.sockets {
            if *id == from || endpoint.kind != SocketKind::Subscriber {
                continue;
            }
            if !endpoint.connected.is_disjoint(&publisher.bound) {
                let _ = endpoint.inbox.send(message.clone());
            }
        }
    }

    fn deal(&self, from: u64, mut message: Message) -> Result<(), TransportError> {
        let dealer = self.sockets.get(&from).ok_or(TransportError::Closed)?;
        let mut addresses: Vec<&String> = dealer.connected.iter().collect();
        addresses.sort();
        let target = addresses
            .iter()
            .find_map(|address| self.bindings.get(*address))
            .and_then(|id| self.sockets.get(id));
        match target {
            Some(endpoint) => {
                message.routing_identity = dealer.identity.clone();
                endpoint
                    .inbox
                    .send(message)
                    .map_err(|_| TransportError::Closed)
            }
            None => Err(TransportError::NoPeer {
                address: addresses
                    .first()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
            }),
        }
    }

    fn route(&self, from: u64, mut message: Message) -> Result<(), TransportError> {
        let router = self.sockets.get(&from).ok_or(TransportError::Closed)?;
        let target_identity = message.routing_identity.clone().unwrap_or_default();
        let mut candidates: Vec<(&u64, &Endpoint)> = self
            .sockets
            .iter()
            .filter(|(id, endpoint)| {
                **id != from
                    && endpoint.identity.as_deref() == Some(target_identity.as_slice())
                    && (!endpoint.connected.is_disjoint(&router.bound)
                        || !endpoint.bound.is_disjoint(&router.connected))
            })
            .collect();
        candidates.sort_by_key(|(id, _)| **id);
        match candidates.first() {
            Some((_, endpoint)) => {
                message.routing_identity = router.identity.clone();
                endpoint
                    .inbox
                    .send(message)
                    .map_err(|_| TransportError::Closed)
            }
            None => Err(TransportError::HostUnreachable {
                identity: display_identity(&target_identity),
            }),
        }
    }
}

/// In-process [`SocketFactory`].
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    hub: Arc<Mutex<Hub>>,
}

impl InMemoryTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent lifecycle events, oldest first.
    pub fn events(&self) -> Vec<SocketEvent> {
        self.hub.lock().events.iter().cloned().collect()
    }

    /// Addresses currently connected by live sockets of `kind`.
    pub fn connected_addresses(&self, kind: SocketKind) -> Vec<String> {
        let hub = self.hub.lock();
        let mut addresses: Vec<String> = hub
            .sockets
            .values()
            .filter(|endpoint| endpoint.kind == kind)
            .flat_map(|endpoint| endpoint.connected.iter().cloned())
            .collect();
        addresses.sort();
        addresses
    }

    /// Whether some live socket is bound at `address`.
    pub fn is_bound(&self, address: &str) -> bool {
        self.hub.lock().bindings.contains_key(address)
    }
}

impl SocketFactory for InMemoryTransport {
    fn create_socket(&self, kind: SocketKind, identity: Option<Vec<u8>>) -> Box<dyn Socket> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.hub.lock();
        hub.next_id += 1;
        let id = hub.next_id;
        hub.sockets.insert(
            id,
            Endpoint {
                kind,
                identity,
                inbox: tx,
                bound: HashSet::new(),
                connected: HashSet::new(),
            },
        );
        Box::new(InMemorySocket {
            id,
            kind,
            hub: Arc::clone(&self.hub),
            inbox: rx,
        })
    }
}

/// Socket created by [`InMemoryTransport`].
pub struct InMemorySocket {
    id: u64,
    kind: SocketKind,
    hub: Arc<Mutex<Hub>>,
    inbox: mpsc::UnboundedReceiver<Message>,
}

impl InMemorySocket {
    fn unsupported(&self, operation: &'static str) -> TransportError {
        TransportError::Unsupported {
            kind: self.kind.as_str(),
            operation,
        }
    }
}

#[async_trait]
impl Socket for InMemorySocket {
    fn kind(&self) -> SocketKind {
        self.kind
    }

    fn bind(&mut self, address: &str) -> Result<(), TransportError> {
        let mut hub = self.hub.lock();
        if hub.bindings.contains_key(address) {
            return Err(TransportError::AddressInUse {
                address: address.to_string(),
            });
        }
        let endpoint = hub.sockets.get_mut(&self.id).ok_or(TransportError::Closed)?;
        endpoint.bound.insert(address.to_string());
        hub.bindings.insert(address.to_string(), self.id);
        hub.record(self.id, SocketAction::Bind, address);
        Ok(())
    }

    fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        let mut hub = self.hub.lock();
        let endpoint = hub.sockets.get_mut(&self.id).ok_or(TransportError::Closed)?;
        if endpoint.connected.insert(address.to_string()) {
            hub.record(self.id, SocketAction::Connect, address);
        }
        Ok(())
    }

    fn disconnect(&mut self, address: &str) -> Result<(), TransportError> {
        let mut hub = self.hub.lock();
        let endpoint = hub.sockets.get_mut(&self.id).ok_or(TransportError::Closed)?;
        if endpoint.connected.remove(address) {
            hub.record(self.id, SocketAction::Disconnect, address);
        }
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        let hub = self.hub.lock();
        trace!(socket = self.id, kind = %self.kind, message = %message.identifier(), "send");
        match self.kind {
            SocketKind::Publisher => {
                hub.publish(self.id, &message);
                Ok(())
            }
            SocketKind::Subscriber => Err(self.unsupported("send")),
            SocketKind::Dealer => hub.deal(self.id, message),
            SocketKind::Router => hub.route(self.id, message),
        }
    }

    async fn receive(&mut self) -> Result<Message, TransportError> {
        if self.kind == SocketKind::Publisher {
            return Err(self.unsupported("receive"));
        }
        self.inbox.recv().await.ok_or(TransportError::Closed)
    }
}

impl Drop for InMemorySocket {
    fn drop(&mut self) {
        let mut hub = self.hub.lock();
        let Some(endpoint) = hub.sockets.get(&self.id) else {
            return;
        };
        let addresses: Vec<String> = endpoint
            .bound
            .iter()
            .chain(endpoint.connected.iter())
            .cloned()
            .collect();
        for address in &addresses {
            hub.record(self.id, SocketAction::Close, address);
        }
        if let Some(endpoint) = hub.sockets.remove(&self.id) {
            for address in endpoint.bound {
                hub.bindings.remove(&address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::control::Ping;
    use crate::message::DistributionPattern;

    fn ping(id: u64) -> Message {
        Message::create(&Ping { ping_id: id }, DistributionPattern::Unicast).expect("create")
    }

    #[tokio::test]
    async fn test_publisher_reaches_connected_subscribers() {
        let transport = InMemoryTransport::new();
        let mut publisher = transport.create_socket(SocketKind::Publisher, None);
        publisher.bind("inproc://pub").expect("bind");

        let mut subscriber = transport.create_socket(SocketKind::Subscriber, None);
        subscriber.connect("inproc://pub").expect("connect");
        let mut unrelated = transport.create_socket(SocketKind::Subscriber, None);
        unrelated.connect("inproc://other").expect("connect");

        publisher.send(ping(1)).await.expect("send");
        let received = subscriber.receive().await.expect("receive");
        assert_eq!(received.payload::<Ping>().expect("decode").ping_id, 1);

        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(10), unrelated.receive()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_dealer_to_router_and_back() {
        let transport = InMemoryTransport::new();
        let mut router = transport.create_socket(SocketKind::Router, None);
        router.bind("inproc://router").expect("bind");

        let mut dealer = transport.create_socket(SocketKind::Dealer, Some(b"actor".to_vec()));
        dealer.connect("inproc://router").expect("connect");

        dealer.send(ping(1)).await.expect("send");
        let mut request = router.receive().await.expect("receive");
        assert_eq!(request.routing_identity.as_deref(), Some(&b"actor"[..]));

        request.routing_identity = Some(b"actor".to_vec());
        router.send(request).await.expect("reply");
        assert!(dealer.receive().await.is_ok());
    }

    #[tokio::test]
    async fn test_router_mandatory_routing() {
        let transport = InMemoryTransport::new();
        let mut router = transport.create_socket(SocketKind::Router, None);
        router.connect("inproc://peer").expect("connect");

        let mut message = ping(1);
        message.routing_identity = Some(b"peer".to_vec());
        let err = router.send(message.clone()).await.expect_err("unreachable");
        assert!(matches!(err, TransportError::HostUnreachable { .. }));

        let mut peer = transport.create_socket(SocketKind::Router, Some(b"peer".to_vec()));
        peer.bind("inproc://peer").expect("bind");
        router.send(message).await.expect("send");
        assert!(peer.receive().await.is_ok());
    }

    #[tokio::test]
    async fn test_dealer_without_peer() {
        let transport = InMemoryTransport::new();
        let mut dealer = transport.create_socket(SocketKind::Dealer, None);
        dealer.connect("inproc://nobody").expect("connect");
        let err = dealer.send(ping(1)).await.expect_err("no peer");
        assert!(err.is_unreachable());
    }

    #[test]
    fn test_bind_conflict_and_release_on_drop() {
        let transport = InMemoryTransport::new();
        let mut a = transport.create_socket(SocketKind::Publisher, None);
        a.bind("inproc://x").expect("bind");

        let mut b = transport.create_socket(SocketKind::Publisher, None);
        assert!(matches!(
            b.bind("inproc://x"),
            Err(TransportError::AddressInUse { .. })
        ));

        drop(a);
        assert!(!transport.is_bound("inproc://x"));
        b.bind("inproc://x").expect("rebind");
    }

    #[test]
    fn test_lifecycle_events_recorded() {
        let transport = InMemoryTransport::new();
        let mut sub = transport.create_socket(SocketKind::Subscriber, None);
        sub.connect("inproc://a").expect("connect");
        assert_eq!(
            transport.connected_addresses(SocketKind::Subscriber),
            vec!["inproc://a".to_string()]
        );
        sub.disconnect("inproc://a").expect("disconnect");
        sub.connect("inproc://b").expect("connect");
        drop(sub);

        let actions: Vec<(SocketAction, String)> = transport
            .events()
            .into_iter()
            .map(|e| (e.action, e.address))
            .collect();
        assert_eq!(
            actions,
            vec![
                (SocketAction::Connect, "inproc://a".to_string()),
                (SocketAction::Disconnect, "inproc://a".to_string()),
                (SocketAction::Connect, "inproc://b".to_string()),
                (SocketAction::Close, "inproc://b".to_string()),
            ]
        );
        assert!(transport.connected_addresses(SocketKind::Subscriber).is_empty());
    }

    #[test]
    fn test_event_log_keeps_most_recent() {
        let transport = InMemoryTransport::new();
        let mut sub = transport.create_socket(SocketKind::Subscriber, None);
        for i in 0..=MAX_RECORDED_EVENTS {
            sub.connect(&format!("inproc://{i}")).expect("connect");
        }

        let events = transport.events();
        assert_eq!(events.len(), MAX_RECORDED_EVENTS);
        assert_eq!(events[0].address, "inproc://1");
        assert_eq!(
            events.last().map(|e| e.address.clone()),
            Some(format!("inproc://{MAX_RECORDED_EVENTS}"))
        );
    }
}
