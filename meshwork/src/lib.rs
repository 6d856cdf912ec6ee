//! # Meshwork
//!
//! Membership, discovery, health monitoring and message routing for a
//! cluster of actor-hosting nodes.
//!
//! Nodes find each other through a small set of rendezvous coordinators:
//!
//! - **Rendezvous directory**: ordered coordinator endpoints with
//!   round-robin failover.
//! - **Discovery channel**: announces and withdraws this node's routes at
//!   the current coordinator and listens to its broadcasts; a silent
//!   coordinator triggers failover to the next one.
//! - **Route discovery throttle**: deduplicates and batches "who handles
//!   this message" queries.
//! - **Peer health**: heartbeats, dead/stale peer detection and
//!   connectivity probes.
//! - **Routing tables and dispatcher**: deliver each message to a local
//!   receiver, forward it to a peer, or both for broadcasts.
//!
//! The network and authorization layers are seams ([`SocketFactory`],
//! [`SecurityProvider`]); [`InMemoryTransport`] and
//! [`SharedKeySecurityProvider`] make a cluster runnable in one process.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Deduplicating round-robin queue.
pub mod collections;

/// Configuration sections and builder.
pub mod config;

/// Cluster discovery: coordinator channel and route-discovery throttle.
pub mod discovery;

/// Message dispatcher.
pub mod dispatch;

/// Error types.
pub mod error;

/// Node assembly.
pub mod fabric;

/// Peer health monitoring.
pub mod health;

/// Route and node identifiers.
pub mod identifier;

/// Message envelope and control payloads.
pub mod message;

/// Local node information.
pub mod node;

/// Rendezvous coordinator directory.
pub mod rendezvous;

/// Routing tables.
pub mod routing;

/// Domain authorization and signing.
pub mod security;

/// Transport seam and in-memory transport.
pub mod transport;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use collections::HashedQueue;
pub use config::{
    ClusterAutoDiscoveryConfig, ClusterMembershipConfig, DiscoveryConfig, FabricConfig,
    FabricConfigBuilder, HealthConfig, RouterConfig,
};
pub use discovery::{
    ClusterMonitor, ClusterMonitorService, DiscoveryMessageListener, DiscoveryMessageSender,
    RouteDiscoveryThrottle, StandaloneClusterMonitor,
};
pub use dispatch::MessageRouter;
pub use error::{
    ConfigError, FabricError, MessageError, RendezvousError, SecurityError, TransportError,
};
pub use fabric::{Fabric, FabricBuilder};
pub use health::{
    ClusterHealthMonitor, ClusterMemberMeta, HeartbeatSender, PeerHealthRegistry, PeerMonitor,
    StandaloneHealthMonitor,
};
pub use identifier::{Identifier, MessageIdentifier, Node, NodeIdentity, ReceiverIdentifier};
pub use message::{CallbackRoute, DistributionPattern, Message, Payload};
pub use node::{Health, LocalNode};
pub use rendezvous::{RendezvousDirectory, RendezvousEndpoint};
pub use routing::{ExternalRoutingTable, InternalRoutingTable, PeerConnection};
pub use security::{SecurityProvider, SharedKeySecurityProvider};
pub use transport::{InMemoryTransport, Socket, SocketFactory, SocketKind};
