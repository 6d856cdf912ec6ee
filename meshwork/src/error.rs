//! Error types for the meshwork fabric.

use thiserror::Error;

/// Errors raised by a transport socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Mandatory routing failed: no connected peer carries the identity.
    #[error("host unreachable: {identity}")]
    HostUnreachable {
        /// Hex or text rendering of the unreachable identity.
        identity: String,
    },

    /// Nothing is bound at any address the socket is connected to.
    #[error("no peer bound at {address}")]
    NoPeer {
        /// The address that had no listener.
        address: String,
    },

    /// Another socket already owns the address.
    #[error("address already in use: {address}")]
    AddressInUse {
        /// The conflicting address.
        address: String,
    },

    /// The socket kind does not support the operation.
    #[error("{operation} is not supported on a {kind} socket")]
    Unsupported {
        /// Socket kind name.
        kind: &'static str,
        /// Attempted operation.
        operation: &'static str,
    },

    /// The socket or the transport has been closed.
    #[error("socket closed")]
    Closed,
}

impl TransportError {
    /// Whether the error means the destination cannot be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            TransportError::HostUnreachable { .. } | TransportError::NoPeer { .. }
        )
    }

    /// Whether the socket will never deliver again.
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

/// Errors from the security/domain collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    /// No domain is configured for the message identity.
    #[error("message identity is not supported: {identity}")]
    NotSupported {
        /// Rendering of the unsupported identity.
        identity: String,
    },

    /// The domain is not allowed on this node.
    #[error("domain not allowed: {domain}")]
    DomainNotAllowed {
        /// The rejected domain.
        domain: String,
    },

    /// The message signature does not match its content.
    #[error("invalid signature for domain {domain}")]
    InvalidSignature {
        /// The domain the message claims.
        domain: String,
    },
}

/// Errors related to message payloads.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Payload serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The message does not carry the requested payload type.
    #[error("payload mismatch: expected {expected}, found {found}")]
    PayloadMismatch {
        /// Identity of the requested payload.
        expected: String,
        /// Identity carried by the message.
        found: String,
    },
}

/// Errors from rendezvous directory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendezvousError {
    /// The configured set contains the same endpoint twice.
    #[error("duplicate rendezvous endpoint: {unicast} / {broadcast}")]
    DuplicateEndpoint {
        /// Unicast address of the duplicate.
        unicast: String,
        /// Broadcast address of the duplicate.
        broadcast: String,
    },

    /// The configured set is empty.
    #[error("rendezvous configuration is empty")]
    Empty,
}

/// Errors from building a [`FabricConfig`](crate::FabricConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No rendezvous server configured while running clustered.
    #[error("at least one rendezvous server is required unless running standalone")]
    MissingRendezvous,

    /// The rendezvous list is invalid.
    #[error("invalid rendezvous configuration: {0}")]
    Rendezvous(#[from] RendezvousError),

    /// An address range has no entries.
    #[error("address range {name} is empty")]
    EmptyAddressRange {
        /// Name of the offending setting.
        name: &'static str,
    },

    /// A numeric setting must be greater than zero.
    #[error("{name} must be greater than zero")]
    MustBePositive {
        /// Name of the offending setting.
        name: &'static str,
    },
}

/// Top-level error for fabric startup and wiring.
#[derive(Debug, Error)]
pub enum FabricError {
    /// No address in a configured range could be bound.
    #[error("failed to bind any address for {component} (tried {tried:?})")]
    BindRangeExhausted {
        /// Component that needed the address.
        component: &'static str,
        /// Every address that was attempted.
        tried: Vec<String>,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport error during startup.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Security error.
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// Message error.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Rendezvous error.
    #[error("rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),

    /// A required component was not supplied to the builder.
    #[error("{component} must be set")]
    MissingComponent {
        /// Name of the component.
        component: &'static str,
    },
}
