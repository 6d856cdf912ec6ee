//! Message envelope.
//!
//! A [`Message`] carries a typed [`Payload`] as an opaque JSON body plus the
//! addressing the fabric routes on: contract identity, optional explicit
//! receiver, distribution pattern, hop trail and callback route.
//!
//! # Example
//!
//! ```
//! use meshwork::{DistributionPattern, Message, Payload};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Greeting {
//!     text: String,
//! }
//!
//! impl Payload for Greeting {
//!     const IDENTITY: &'static [u8] = b"GREETING";
//! }
//!
//! let message = Message::create(&Greeting { text: "hi".into() }, DistributionPattern::Unicast)
//!     .unwrap();
//! assert!(message.is::<Greeting>());
//! assert_eq!(message.payload::<Greeting>().unwrap().text, "hi");
//! ```

pub mod control;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{MessageError, SecurityError};
use crate::identifier::{Identifier, MessageIdentifier, Node, NodeIdentity, ReceiverIdentifier};
use crate::security::SecurityProvider;

/// A typed message body.
pub trait Payload: Serialize + DeserializeOwned {
    /// Contract identity.
    const IDENTITY: &'static [u8];

    /// Contract version.
    const VERSION: u16 = 1;

    /// Partition key for this instance; empty when unpartitioned.
    fn partition(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Unpartitioned identifier of this contract.
    fn identifier() -> MessageIdentifier {
        MessageIdentifier::new(Self::IDENTITY.to_vec(), Self::VERSION, Vec::new())
    }
}

/// Whether a message goes to one handler or to all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistributionPattern {
    /// Exactly one handler, chosen round-robin.
    Unicast,
    /// Every known handler, local and remote.
    Broadcast,
}

/// Where replies and exceptions for a message should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackRoute {
    /// Receiver waiting for the callback.
    pub receiver_identity: ReceiverIdentifier,
    /// Node hosting that receiver, if remote.
    pub receiver_node_identity: Option<NodeIdentity>,
    /// Contracts that complete the callback.
    pub points: Vec<MessageIdentifier>,
    /// Key matching the callback to the original call.
    pub key: i64,
}

/// Unit of routing in the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Contract identity.
    pub identity: Vec<u8>,
    /// Contract version.
    pub version: u16,
    /// Partition key.
    pub partition: Vec<u8>,
    /// Unicast or broadcast.
    pub distribution: DistributionPattern,
    /// Explicit receiver; overrides contract lookup when set.
    pub receiver_identity: Option<ReceiverIdentifier>,
    /// Node the explicit receiver lives on.
    pub receiver_node_identity: Option<NodeIdentity>,
    /// Nodes this message already passed through.
    pub hops: Vec<Node>,
    /// Callback routing, if the sender awaits a reply.
    pub callback: Option<CallbackRoute>,
    /// Correlates a conversation across hops.
    pub correlation_id: Vec<u8>,
    /// Authorization domain.
    pub domain: String,
    /// Signature over [`Message::signable_content`].
    pub signature: Vec<u8>,
    /// Transport-level identity: the peer a router socket sends to, or the
    /// peer a router socket received from.
    pub routing_identity: Option<Vec<u8>>,
    /// Serialized payload.
    pub body: Vec<u8>,
}

impl Message {
    /// Create a message carrying `payload`.
    pub fn create<P: Payload>(
        payload: &P,
        distribution: DistributionPattern,
    ) -> Result<Self, MessageError> {
        Ok(Self {
            identity: P::IDENTITY.to_vec(),
            version: P::VERSION,
            partition: payload.partition(),
            distribution,
            receiver_identity: None,
            receiver_node_identity: None,
            hops: Vec::new(),
            callback: None,
            correlation_id: rand::random::<[u8; 16]>().to_vec(),
            domain: String::new(),
            signature: Vec::new(),
            routing_identity: None,
            body: serde_json::to_vec(payload)?,
        })
    }

    /// Decode the body as `P`.
    pub fn payload<P: Payload>(&self) -> Result<P, MessageError> {
        if !self.is::<P>() {
            return Err(MessageError::PayloadMismatch {
                expected: String::from_utf8_lossy(P::IDENTITY).into_owned(),
                found: String::from_utf8_lossy(&self.identity).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Whether the message carries contract `P`.
    pub fn is<P: Payload>(&self) -> bool {
        self.identity == P::IDENTITY && self.version == P::VERSION
    }

    /// Contract identifier of this message.
    pub fn identifier(&self) -> MessageIdentifier {
        MessageIdentifier::new(self.identity.clone(), self.version, self.partition.clone())
    }

    /// Key used for routing lookups: the explicit receiver, else the contract.
    pub fn routing_key(&self) -> Identifier {
        match &self.receiver_identity {
            Some(receiver) => Identifier::Receiver(receiver.clone()),
            None => Identifier::Message(self.identifier()),
        }
    }

    /// Whether the message is a broadcast.
    pub fn is_broadcast(&self) -> bool {
        self.distribution == DistributionPattern::Broadcast
    }

    /// Number of nodes the message passed through.
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Record that the message leaves `node`.
    pub fn push_hop(&mut self, node: Node) {
        self.hops.push(node);
    }

    /// Whether `identity` already appears in the hop trail.
    pub fn visited(&self, identity: &NodeIdentity) -> bool {
        self.hops.iter().any(|hop| &hop.identity == identity)
    }

    /// Address the message to a specific receiver.
    pub fn set_receiver(&mut self, receiver: ReceiverIdentifier, node: Option<NodeIdentity>) {
        self.receiver_identity = Some(receiver);
        self.receiver_node_identity = node;
    }

    /// Set the authorization domain.
    pub fn set_domain(&mut self, domain: impl Into<String>) {
        self.domain = domain.into();
    }

    /// Bytes covered by the signature.
    pub fn signable_content(&self) -> Vec<u8> {
        let mut content =
            Vec::with_capacity(self.identity.len() + self.partition.len() + self.body.len() + 2);
        content.extend_from_slice(&self.identity);
        content.extend_from_slice(&self.version.to_le_bytes());
        content.extend_from_slice(&self.partition);
        content.extend_from_slice(&self.body);
        content
    }

    /// Sign with the key of the message's domain.
    pub fn sign(&mut self, security: &dyn SecurityProvider) -> Result<(), SecurityError> {
        self.signature = security.sign(&self.domain, &self.signable_content())?;
        Ok(())
    }

    /// Verify the signature against the message's domain.
    pub fn verify(&self, security: &dyn SecurityProvider) -> Result<(), SecurityError> {
        if !security.domain_is_allowed(&self.domain) {
            return Err(SecurityError::DomainNotAllowed {
                domain: self.domain.clone(),
            });
        }
        security.verify(&self.domain, &self.signable_content(), &self.signature)
    }

    /// Build an [`control::Exception`] routed back along `original`'s callback.
    ///
    /// Callback route, correlation id, domain and hop trail are preserved.
    pub fn exception(original: &Message, error: impl ToString) -> Result<Message, MessageError> {
        let mut message = Message::create(
            &control::Exception {
                error: error.to_string(),
            },
            DistributionPattern::Unicast,
        )?;
        message.correlation_id = original.correlation_id.clone();
        message.hops = original.hops.clone();
        message.domain = original.domain.clone();
        message.callback = original.callback.clone();
        if let Some(callback) = &original.callback {
            message.receiver_identity = Some(callback.receiver_identity.clone());
            message.receiver_node_identity = callback.receiver_node_identity.clone();
        }
        Ok(message)
    }
}
