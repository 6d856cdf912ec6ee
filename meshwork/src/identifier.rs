//! Identifiers used as routing keys.
//!
//! This module provides the keys every routing structure is indexed by:
//! - [`MessageIdentifier`]: a concrete message contract (identity, version, partition)
//! - [`ReceiverIdentifier`]: the identity of a single receiver (actor or hub socket)
//! - [`Identifier`]: either of the above, used as a route key
//! - [`NodeIdentity`] and [`Node`]: a peer reachable over the scale-out network

use std::fmt;

use serde::{Deserialize, Serialize};

/// Renders identity bytes as text when printable, hex otherwise.
pub(crate) fn display_bytes(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !bytes.is_empty() && bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        write!(f, "{}", String::from_utf8_lossy(bytes))
    } else {
        for b in bytes {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Owned rendering of identity bytes, see [`display_bytes`].
pub(crate) fn display_identity(bytes: &[u8]) -> String {
    struct Shown<'a>(&'a [u8]);

    impl fmt::Display for Shown<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            display_bytes(self.0, f)
        }
    }

    Shown(bytes).to_string()
}

/// A concrete message contract.
///
/// Two identifiers are equal when identity, version and partition all match.
///
/// # Examples
///
/// ```
/// use meshwork::MessageIdentifier;
///
/// let a = MessageIdentifier::new(b"ORDER".to_vec(), 1, Vec::new());
/// let b = MessageIdentifier::new(b"ORDER".to_vec(), 2, Vec::new());
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageIdentifier {
    /// Contract identity.
    pub identity: Vec<u8>,
    /// Contract version.
    pub version: u16,
    /// Partition key; empty when the contract is not partitioned.
    pub partition: Vec<u8>,
}

impl MessageIdentifier {
    /// Create a new message identifier.
    pub fn new(identity: Vec<u8>, version: u16, partition: Vec<u8>) -> Self {
        Self {
            identity,
            version,
            partition,
        }
    }
}

impl fmt::Display for MessageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        display_bytes(&self.identity, f)?;
        write!(f, "@v{}", self.version)?;
        if !self.partition.is_empty() {
            write!(f, "/")?;
            display_bytes(&self.partition, f)?;
        }
        Ok(())
    }
}

/// Identity of a single receiver socket (an actor or a message hub).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiverIdentifier {
    /// Raw receiver identity.
    pub identity: Vec<u8>,
}

impl ReceiverIdentifier {
    /// Create a receiver identifier from raw bytes.
    pub fn new(identity: impl Into<Vec<u8>>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    /// Create a random receiver identifier.
    pub fn random() -> Self {
        Self {
            identity: rand::random::<[u8; 16]>().to_vec(),
        }
    }
}

impl fmt::Display for ReceiverIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        display_bytes(&self.identity, f)
    }
}

/// Route key.
///
/// `Message` routes by contract; `Receiver` is the wildcard
/// "any message for this receiver" registration, which equals another
/// receiver identifier by identity only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identifier {
    /// A concrete message contract.
    Message(MessageIdentifier),
    /// Any message explicitly addressed to this receiver.
    Receiver(ReceiverIdentifier),
}

impl Identifier {
    /// Whether this is the receiver wildcard.
    pub fn is_receiver(&self) -> bool {
        matches!(self, Identifier::Receiver(_))
    }

    /// Whether this is a concrete message contract.
    pub fn is_message(&self) -> bool {
        matches!(self, Identifier::Message(_))
    }

    /// Raw identity bytes of either variant.
    pub fn identity(&self) -> &[u8] {
        match self {
            Identifier::Message(m) => &m.identity,
            Identifier::Receiver(r) => &r.identity,
        }
    }
}

impl From<MessageIdentifier> for Identifier {
    fn from(value: MessageIdentifier) -> Self {
        Identifier::Message(value)
    }
}

impl From<ReceiverIdentifier> for Identifier {
    fn from(value: ReceiverIdentifier) -> Self {
        Identifier::Receiver(value)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Message(m) => write!(f, "message:{}", m),
            Identifier::Receiver(r) => write!(f, "receiver:{}", r),
        }
    }
}

/// Identity of a node on the scale-out network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdentity(pub Vec<u8>);

impl NodeIdentity {
    /// Create a node identity from raw bytes.
    pub fn new(identity: impl Into<Vec<u8>>) -> Self {
        Self(identity.into())
    }

    /// Create a random node identity.
    pub fn random() -> Self {
        Self(rand::random::<[u8; 16]>().to_vec())
    }

    /// Raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        display_bytes(&self.0, f)
    }
}

/// A peer reachable over the scale-out network: identity + address.
///
/// Equal iff both the identity bytes and the address match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Socket identity of the node's scale-out listener.
    pub identity: NodeIdentity,
    /// Address the scale-out listener is bound to.
    pub address: String,
}

impl Node {
    /// Create a new node.
    pub fn new(identity: NodeIdentity, address: impl Into<String>) -> Self {
        Self {
            identity,
            address: address.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.address)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_message_identifier_equality_is_structural() {
        let a = MessageIdentifier::new(b"A".to_vec(), 1, b"p".to_vec());
        let b = MessageIdentifier::new(b"A".to_vec(), 1, b"p".to_vec());
        let c = MessageIdentifier::new(b"A".to_vec(), 1, b"q".to_vec());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_receiver_and_message_never_equal() {
        let message = Identifier::Message(MessageIdentifier::new(b"X".to_vec(), 0, Vec::new()));
        let receiver = Identifier::Receiver(ReceiverIdentifier::new(b"X".to_vec()));
        assert_ne!(message, receiver);

        let mut set = HashSet::new();
        set.insert(message);
        set.insert(receiver);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_node_equality_requires_both_fields() {
        let a = Node::new(NodeIdentity::new(b"n1".to_vec()), "tcp://10.0.0.1:5000");
        let b = Node::new(NodeIdentity::new(b"n1".to_vec()), "tcp://10.0.0.1:5000");
        let c = Node::new(NodeIdentity::new(b"n1".to_vec()), "tcp://10.0.0.2:5000");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_display_printable_and_binary() {
        let printable = MessageIdentifier::new(b"ORDER".to_vec(), 3, Vec::new());
        assert_eq!(printable.to_string(), "ORDER@v3");

        let binary = NodeIdentity::new(vec![0x00, 0xff]);
        assert_eq!(binary.to_string(), "00ff");
    }
}
