use std::collections::HashMap;
use std::fmt;

use base64::prelude::{BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};
use ssh_key::{HashAlg, PrivateKey, PublicKey};
use tracing::warn;

pub mod config;
pub mod identity;
pub mod manager;
pub mod pem;
pub mod record;

pub use manager::{KeyManager, ManagerError};
pub use record::StoredKey;

/// Crate-wide mutex used by tests that mutate XDG environment variables.
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Unique identifier for a configured key.
///
/// Generated identifiers are decimal strings of a random non-negative 63-bit
/// integer.  Identifiers decoded from agent comments are not validated any
/// further: an id that matches no stored record simply fails to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A key the user has registered, as presented to callers.
///
/// `encrypted` is derived from the PEM material on every read; it is never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredKey {
    pub id: KeyId,
    pub name: String,
    pub encrypted: bool,
}

/// A key currently held by the agent.
///
/// The public key blob is carried as standard base64 text so the value can
/// cross text-only channels (JSON output, IPC) unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedKey {
    /// SSH key type reported by the agent (e.g. `"ssh-ed25519"`).
    #[serde(rename = "type")]
    pub key_type: String,
    blob: String,
    pub comment: String,
}

impl LoadedKey {
    pub fn new(key_type: impl Into<String>, blob: &[u8], comment: impl Into<String>) -> Self {
        let mut key = Self {
            key_type: key_type.into(),
            blob: String::new(),
            comment: comment.into(),
        };
        key.set_blob(blob);
        key
    }

    pub fn set_blob(&mut self, blob: &[u8]) {
        self.blob = BASE64_STANDARD.encode(blob);
    }

    /// Public key material in SSH wire format.
    ///
    /// A blob that does not decode is logged and reported as empty.
    pub fn blob(&self) -> Vec<u8> {
        match BASE64_STANDARD.decode(&self.blob) {
            Ok(b) => b,
            Err(e) => {
                warn!(key_type = %self.key_type, "failed to decode key blob: {e}");
                Vec::new()
            }
        }
    }

    /// The configured key this loaded key was produced from, if any.
    pub fn id(&self) -> Option<KeyId> {
        identity::decode(&self.comment)
    }

    /// SHA-256 fingerprint (`"SHA256:…"`), or `None` if the blob is not a
    /// valid SSH public key.
    pub fn fingerprint(&self) -> Option<String> {
        let public_key = PublicKey::from_bytes(&self.blob()).ok()?;
        Some(public_key.fingerprint(HashAlg::Sha256).to_string())
    }
}

// ---------------------------------------------------------------------------
// Agent contract
// ---------------------------------------------------------------------------

/// A key as listed by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentKey {
    /// Key algorithm name (e.g. `"ssh-ed25519"`).
    pub format: String,
    /// Public key in SSH wire format.
    pub blob: Vec<u8>,
    pub comment: String,
}

/// A decrypted private key to hand to the agent.
pub struct AddedKey {
    pub private_key: PrivateKey,
    pub comment: String,
}

impl fmt::Debug for AddedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddedKey")
            .field("algorithm", &self.private_key.algorithm())
            .field("comment", &self.comment)
            .finish_non_exhaustive()
    }
}

/// Identifies a loaded key by its public half, as the agent protocol does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyDescriptor {
    pub format: String,
    pub blob: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("key not found")]
    NotFound,
    #[error("agent refused request: {0}")]
    Refused(String),
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// An SSH agent the manager can load keys into.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    /// Keys currently held by the agent, in the order the agent reports them.
    async fn list(&self) -> Result<Vec<AgentKey>, AgentError>;

    async fn add(&self, key: AddedKey) -> Result<(), AgentError>;

    async fn remove(&self, key: &PublicKeyDescriptor) -> Result<(), AgentError>;
}

// ---------------------------------------------------------------------------
// Persistent store contract
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Flat key/value storage of structured values.
///
/// Each call is atomic on its own; there is no cross-call transaction.
#[async_trait::async_trait]
pub trait PersistentStore: Send + Sync {
    /// Insert or replace every entry in `entries`.
    async fn set(&self, entries: HashMap<String, serde_json::Value>) -> Result<(), StoreError>;

    /// Return the entire namespace.  Filtering is the caller's job.
    async fn get(&self) -> Result<HashMap<String, serde_json::Value>, StoreError>;

    /// Delete the given keys.  Absent keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
}
