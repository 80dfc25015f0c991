//! Wire-level event envelope and the signer seam used by callers.
//!
//! The subscription core treats events as opaque: only `id` is read, for
//! deduplication. Signature checks and encryption live with the callers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A signed Nostr event (NIP-01).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}

/// An event before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer unavailable: {0}")]
    Unavailable(String),

    #[error("signing rejected: {0}")]
    Rejected(String),
}

/// Produces signed events on behalf of callers (local key, NIP-46 bunker,
/// browser extension...). The subscription core never calls it.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex-encoded public key of the signing identity.
    async fn public_key(&self) -> Result<String, SignerError>;

    /// Compute the id and signature for `unsigned`.
    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError>;
}
