//! Routing tables consulted by the dispatcher.

pub mod external;
pub mod internal;

pub use external::{ExternalRoutingTable, PeerConnection};
pub use internal::InternalRoutingTable;
