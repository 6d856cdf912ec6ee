//! Transport seam.
//!
//! The fabric talks to the network through four socket kinds with
//! ZeroMQ-like semantics:
//!
//! | Kind | Sends to | Receives from |
//! |------|----------|---------------|
//! | [`SocketKind::Publisher`] | every subscriber connected to a bound address | - |
//! | [`SocketKind::Subscriber`] | - | publishers it is connected to |
//! | [`SocketKind::Dealer`] | the socket bound at a connected address | routers |
//! | [`SocketKind::Router`] | the peer named by [`Message::routing_identity`] | dealers and routers |
//!
//! Router sends use mandatory routing: an unknown routing identity fails
//! with [`TransportError::HostUnreachable`] instead of being dropped.
//!
//! [`InMemoryTransport`](memory::InMemoryTransport) implements the
//! contract in process.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::{FabricError, TransportError};
use crate::message::Message;

pub use memory::{InMemoryTransport, SocketAction, SocketEvent, MAX_RECORDED_EVENTS};

/// Socket kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// Fan-out sender.
    Publisher,
    /// Fan-in receiver of publishers.
    Subscriber,
    /// Point-to-point sender/receiver.
    Dealer,
    /// Identity-addressed sender/receiver.
    Router,
}

impl SocketKind {
    /// Lowercase kind name.
    pub fn as_str(self) -> &'static str {
        match self {
            SocketKind::Publisher => "publisher",
            SocketKind::Subscriber => "subscriber",
            SocketKind::Dealer => "dealer",
            SocketKind::Router => "router",
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport socket.
///
/// Sockets are owned by a single loop and are never shared.
#[async_trait]
pub trait Socket: Send {
    /// Kind of this socket.
    fn kind(&self) -> SocketKind;

    /// Bind to `address`.
    fn bind(&mut self, address: &str) -> Result<(), TransportError>;

    /// Connect to `address`. The address need not be bound yet.
    fn connect(&mut self, address: &str) -> Result<(), TransportError>;

    /// Drop the connection to `address`.
    fn disconnect(&mut self, address: &str) -> Result<(), TransportError>;

    /// Send a message.
    async fn send(&mut self, message: Message) -> Result<(), TransportError>;

    /// Wait for the next message.
    async fn receive(&mut self) -> Result<Message, TransportError>;
}

/// Creates sockets.
pub trait SocketFactory: Send + Sync {
    /// Create a socket of `kind`, with an optional routing identity.
    fn create_socket(&self, kind: SocketKind, identity: Option<Vec<u8>>) -> Box<dyn Socket>;
}

/// Bind `socket` to the first address of `range` that is free.
///
/// Returns the bound address, or [`FabricError::BindRangeExhausted`]
/// when every address fails.
pub fn bind_first_free(
    socket: &mut dyn Socket,
    range: &[String],
    component: &'static str,
) -> Result<String, FabricError> {
    for address in range {
        match socket.bind(address) {
            Ok(()) => {
                debug!(component, address = %address, "bound");
                return Ok(address.clone());
            }
            Err(e) => debug!(component, address = %address, error = %e, "bind failed"),
        }
    }
    error!(component, tried = ?range, "no free address in range");
    Err(FabricError::BindRangeExhausted {
        component,
        tried: range.to_vec(),
    })
}
