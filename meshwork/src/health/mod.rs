//! Peer health: heartbeat publishing, registry and monitor.

pub mod heartbeat;
pub mod monitor;
pub mod registry;

pub use heartbeat::HeartbeatSender;
pub use monitor::{ClusterHealthMonitor, PeerMonitor, StandaloneHealthMonitor};
pub use registry::{ClusterMemberMeta, PeerHealthRegistry};
