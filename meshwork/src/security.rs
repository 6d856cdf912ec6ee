//! Security and domain authorization seam.
//!
//! Every message identity belongs to an authorization *domain*. A node
//! only accepts and announces routes for the domains it is allowed in,
//! and every control message is signed with its domain's key.
//!
//! [`SecurityProvider`] is the seam to the real authorization system.
//! [`SharedKeySecurityProvider`] is a static implementation keyed by
//! per-domain secrets, suitable for tests and closed deployments.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::SecurityError;
use crate::identifier::{Identifier, MessageIdentifier};

/// Resolves domains and signs/verifies message content.
pub trait SecurityProvider: fmt::Debug + Send + Sync {
    /// Domain owning messages with this identity.
    fn domain(&self, identity: &[u8]) -> Result<String, SecurityError>;

    /// Every domain this node is allowed in.
    fn allowed_domains(&self) -> Vec<String>;

    /// Whether `domain` is allowed on this node.
    fn domain_is_allowed(&self, domain: &str) -> bool;

    /// Sign `content` with the key of `domain`.
    fn sign(&self, domain: &str, content: &[u8]) -> Result<Vec<u8>, SecurityError>;

    /// Verify `signature` over `content` for `domain`.
    fn verify(&self, domain: &str, content: &[u8], signature: &[u8]) -> Result<(), SecurityError>;

    /// Domain of a message contract. Defaults to identity lookup.
    fn domain_of(&self, identifier: &MessageIdentifier) -> Result<String, SecurityError> {
        self.domain(&identifier.identity)
    }
}

/// Groups routes by the domain they are announced in.
///
/// Receiver wildcards belong to every allowed domain. Message routes whose
/// domain cannot be resolved are skipped.
pub(crate) fn group_by_domain(
    security: &dyn SecurityProvider,
    routes: Vec<Identifier>,
) -> BTreeMap<String, Vec<Identifier>> {
    let mut grouped: BTreeMap<String, Vec<Identifier>> = BTreeMap::new();
    for route in routes {
        let domains = match &route {
            Identifier::Receiver(_) => security.allowed_domains(),
            Identifier::Message(identifier) => match security.domain_of(identifier) {
                Ok(domain) => vec![domain],
                Err(e) => {
                    warn!(route = %route, error = %e, "route has no domain");
                    continue;
                }
            },
        };
        for domain in domains {
            grouped.entry(domain).or_default().push(route.clone());
        }
    }
    grouped
}

/// Static security provider with one shared secret per domain.
///
/// Signatures are `SHA-256(key || content)`.
///
/// # Example
///
/// ```
/// use meshwork::{SecurityProvider, SharedKeySecurityProvider};
///
/// let security = SharedKeySecurityProvider::new()
///     .with_domain("orders", b"secret".to_vec())
///     .with_identity(b"PLACE-ORDER".to_vec(), "orders");
///
/// assert_eq!(security.domain(b"PLACE-ORDER").unwrap(), "orders");
/// assert!(security.domain(b"UNKNOWN").is_err());
/// ```
#[derive(Clone, Default)]
pub struct SharedKeySecurityProvider {
    keys: HashMap<String, Vec<u8>>,
    identities: HashMap<Vec<u8>, String>,
    default_domain: Option<String>,
}

impl SharedKeySecurityProvider {
    /// Create a provider with no domains.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with a single domain that owns every identity.
    pub fn single_domain(domain: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        let domain = domain.into();
        Self::new()
            .with_domain(domain.clone(), key)
            .with_default_domain(domain)
    }

    /// Allow `domain` on this node, signing with `key`.
    pub fn with_domain(mut self, domain: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(domain.into(), key.into());
        self
    }

    /// Map a message identity to a domain.
    pub fn with_identity(
        mut self,
        identity: impl Into<Vec<u8>>,
        domain: impl Into<String>,
    ) -> Self {
        self.identities.insert(identity.into(), domain.into());
        self
    }

    /// Domain used for identities without an explicit mapping.
    pub fn with_default_domain(mut self, domain: impl Into<String>) -> Self {
        self.default_domain = Some(domain.into());
        self
    }

    fn key(&self, domain: &str) -> Result<&[u8], SecurityError> {
        self.keys
            .get(domain)
            .map(Vec::as_slice)
            .ok_or_else(|| SecurityError::DomainNotAllowed {
                domain: domain.to_string(),
            })
    }

    fn digest(key: &[u8], content: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(content);
        hasher.finalize().to_vec()
    }
}

impl fmt::Debug for SharedKeySecurityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // keys stay out of logs
        let mut domains: Vec<&String> = self.keys.keys().collect();
        domains.sort();
        f.debug_struct("SharedKeySecurityProvider")
            .field("domains", &domains)
            .field("identities", &self.identities.len())
            .field("default_domain", &self.default_domain)
            .finish()
    }
}

impl SecurityProvider for SharedKeySecurityProvider {
    fn domain(&self, identity: &[u8]) -> Result<String, SecurityError> {
        self.identities
            .get(identity)
            .or(self.default_domain.as_ref())
            .cloned()
            .ok_or_else(|| SecurityError::NotSupported {
                identity: String::from_utf8_lossy(identity).into_owned(),
            })
    }

    fn allowed_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.keys.keys().cloned().collect();
        domains.sort();
        domains
    }

    fn domain_is_allowed(&self, domain: &str) -> bool {
        self.keys.contains_key(domain)
    }

    fn sign(&self, domain: &str, content: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let key = self.key(domain)?;
        Ok(Self::digest(key, content))
    }

    fn verify(&self, domain: &str, content: &[u8], signature: &[u8]) -> Result<(), SecurityError> {
        let key = self.key(domain)?;
        if Self::digest(key, content) == signature {
            Ok(())
        } else {
            Err(SecurityError::InvalidSignature {
                domain: domain.to_string(),
            })
        }
    }
}
