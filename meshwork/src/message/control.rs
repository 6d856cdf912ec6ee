//! Control-plane payloads exchanged between nodes, coordinators and the
//! fabric's own loops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Message, Payload};
use crate::identifier::{Identifier, Node, NodeIdentity, ReceiverIdentifier};
use crate::node::Health;
use crate::rendezvous::RendezvousEndpoint;

macro_rules! control_payload {
    ($($ty:ident => $identity:literal),* $(,)?) => {
        $(
            impl Payload for $ty {
                const IDENTITY: &'static [u8] = $identity;
            }
        )*

        /// Kind of a control message, resolved from its identity.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ControlKind {
            $(
                #[doc = concat!("[`", stringify!($ty), "`]")]
                $ty,
            )*
        }

        impl ControlKind {
            /// Kind of `message`, or `None` for application messages.
            pub fn of(message: &Message) -> Option<ControlKind> {
                $(
                    if message.is::<$ty>() {
                        return Some(ControlKind::$ty);
                    }
                )*
                None
            }
        }
    };
}

control_payload! {
    Ping => b"PING",
    Pong => b"PONG",
    Heartbeat => b"HEARTBEAT",
    StartPeerMonitoring => b"STARTPEERMONITORING",
    AddPeer => b"ADDPEER",
    DeletePeer => b"DELETEPEER",
    CheckDeadPeers => b"CHECKDEADPEERS",
    CheckStalePeers => b"CHECKSTALEPEERS",
    CheckPeerConnection => b"CHECKPEERCONNECTION",
    RegisterInternalMessageRoute => b"REGINTROUTE",
    RegisterExternalMessageRoute => b"REGEXTROUTE",
    UnregisterMessageRoute => b"UNREGMSGROUTE",
    UnregisterNode => b"UNREGNODE",
    UnregisterUnreachableNode => b"UNREGUNREACHNODE",
    DiscoverMessageRoute => b"DISCOVERMSGROUTE",
    RequestClusterMessageRoutes => b"REQCLUSTERROUTES",
    RequestNodeMessageRoutes => b"REQNODEROUTES",
    RendezvousConfigurationChanged => b"RNDZRECONFIG",
    RendezvousNotLeader => b"RNDZNOTLEADER",
    Exception => b"EXCEPTION",
}

impl ControlKind {
    /// Messages the discovery listener forwards to the dispatcher.
    pub fn is_dispatcher_bound(self) -> bool {
        matches!(
            self,
            ControlKind::RegisterExternalMessageRoute
                | ControlKind::UnregisterMessageRoute
                | ControlKind::UnregisterNode
                | ControlKind::DiscoverMessageRoute
                | ControlKind::RequestClusterMessageRoutes
                | ControlKind::RequestNodeMessageRoutes
        )
    }
}

/// Liveness probe. Coordinators broadcast it as their heartbeat; nodes
/// send it to each other to test connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Probe sequence number.
    pub ping_id: u64,
}

/// Reply to a coordinator [`Ping`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Sequence number of the answered ping.
    pub ping_id: u64,
    /// The replying node.
    pub node: Node,
}

/// Periodic liveness signal published by every node's heartbeat sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Node emitting the heartbeat.
    pub node_identity: NodeIdentity,
    /// Interval between two heartbeats.
    pub heartbeat_interval: Duration,
    /// Address the heartbeat is published on.
    pub health_address: String,
}

/// Begin watching a peer the dispatcher just connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPeerMonitoring {
    /// The peer.
    pub node: Node,
    /// Where its heartbeats are published.
    pub health: Health,
}

/// Register a peer with the health monitor without marking it connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeer {
    /// The peer.
    pub node: Node,
    /// Where its heartbeats are published.
    pub health: Health,
}

/// Forget a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePeer {
    /// The peer to forget.
    pub node_identity: NodeIdentity,
}

/// Sweep connected peers whose heartbeats stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDeadPeers;

/// Sweep unconnected peers that have been quiet for too long.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStalePeers;

/// Probe connectivity to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPeerConnection {
    /// The peer to probe.
    pub node_identity: NodeIdentity,
}

/// One route offered by a local receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageContract {
    /// The route key.
    pub identifier: Identifier,
    /// Never announce this route to the cluster.
    pub keep_local: bool,
}

/// A local actor or hub registers the routes it handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterInternalMessageRoute {
    /// The registering receiver.
    pub receiver_identity: ReceiverIdentifier,
    /// Routes it handles.
    pub routes: Vec<MessageContract>,
}

/// A remote node announces the routes it handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterExternalMessageRoute {
    /// The announcing node.
    pub node: Node,
    /// Where its heartbeats are published.
    pub health: Health,
    /// Routes it handles.
    pub routes: Vec<Identifier>,
}

/// A node withdraws some of its routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterMessageRoute {
    /// The withdrawing node.
    pub node: Node,
    /// Routes withdrawn.
    pub routes: Vec<Identifier>,
}

/// A node leaves the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterNode {
    /// The departing node.
    pub node: Node,
}

/// The health monitor declares a peer unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterUnreachableNode {
    /// The unreachable peer.
    pub node_identity: NodeIdentity,
}

/// Ask the cluster who handles `route`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverMessageRoute {
    /// Node asking.
    pub requestor: Node,
    /// Route being looked up.
    pub route: Identifier,
}

/// Ask every node to re-announce its routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestClusterMessageRoutes {
    /// Node asking.
    pub requestor: Node,
}

/// Ask one node to re-announce its routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestNodeMessageRoutes {
    /// Node asking.
    pub requestor: Node,
    /// Node expected to answer.
    pub target_node_identity: NodeIdentity,
}

/// A coordinator announces the new coordinator set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousConfigurationChanged {
    /// New ordered set.
    pub nodes: Vec<RendezvousEndpoint>,
}

/// A coordinator tells nodes it is not the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousNotLeader {
    /// The actual leader.
    pub new_leader: RendezvousEndpoint,
}

/// Failure report routed back along a callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    /// Error description.
    pub error: String,
}
