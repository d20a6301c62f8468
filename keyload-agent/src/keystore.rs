//! In-memory key store.
//!
//! The [`KeyStore`] holds every private key added to the agent, in the order
//! they were added.  Keys live only in process memory; `keyloadd` restarting
//! empties the store.
//!
//! Thread safety: all mutations go through `Arc<RwLock<KeyStore>>`.

use std::sync::{Arc, RwLock};

use ssh_key::{HashAlg, PrivateKey};
use tracing::debug;

/// An individual key held by the agent.
#[derive(Clone)]
pub struct KeyEntry {
    /// The private key (zeroized on drop via `ssh_key::PrivateKey`).
    pub private_key: PrivateKey,

    /// Comment supplied by the client that added the key.
    pub comment: String,

    /// SHA-256 fingerprint string (e.g. `"SHA256:abc123…"`).
    pub fingerprint: String,
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("comment", &self.comment)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Shared, thread-safe key store.
///
/// Create with [`KeyStore::new`] and share via [`Arc::clone`].
///
/// Keys are unique by fingerprint.  Adding a key that is already present
/// replaces its entry in place (new comment, same position), matching how
/// OpenSSH's agent treats re-adds.
#[derive(Debug, Default)]
pub struct KeyStore {
    entries: Vec<KeyEntry>,
}

impl KeyStore {
    /// Create an empty key store.
    pub fn new() -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Insert a key entry, replacing any entry with the same fingerprint.
    pub fn insert(&mut self, entry: KeyEntry) {
        debug!(
            fingerprint = %entry.fingerprint,
            comment = %entry.comment,
            "keystore: adding key"
        );
        match self
            .entries
            .iter_mut()
            .find(|e| e.fingerprint == entry.fingerprint)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Remove the key with `fingerprint`.  Returns `false` if it was absent.
    pub fn remove(&mut self, fingerprint: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.fingerprint != fingerprint);
        let removed = before != self.entries.len();
        debug!(fingerprint, removed, "keystore: remove key");
        removed
    }

    /// Remove all keys.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Look up a key by its SHA-256 fingerprint string.
    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| e.fingerprint == fingerprint)
    }

    /// Iterate all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build a [`KeyEntry`] from a decrypted [`PrivateKey`].
pub fn build_entry(private_key: PrivateKey, comment: String) -> KeyEntry {
    let fingerprint = private_key.public_key().fingerprint(HashAlg::Sha256).to_string();
    KeyEntry {
        private_key,
        comment,
        fingerprint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pem: &str, comment: &str) -> KeyEntry {
        let key = PrivateKey::from_openssh(pem).unwrap();
        build_entry(key, comment.to_string())
    }

    fn first() -> KeyEntry {
        entry(include_str!("../../keyload-core/testdata/ed25519.pem"), "first")
    }

    fn second() -> KeyEntry {
        entry(include_str!("../../keyload-core/testdata/ed25519_second.pem"), "second")
    }

    #[test]
    fn build_entry_derives_fingerprint() {
        let e = first();
        assert!(e.fingerprint.starts_with("SHA256:"));
        assert_eq!(
            e.fingerprint,
            e.private_key.public_key().fingerprint(HashAlg::Sha256).to_string()
        );
        assert_ne!(e.fingerprint, second().fingerprint);
    }

    #[test]
    fn insert_keeps_order() {
        let mut store = KeyStore::default();
        store.insert(first());
        store.insert(second());
        let comments: Vec<&str> = store.iter().map(|e| e.comment.as_str()).collect();
        assert_eq!(comments, ["first", "second"]);
    }

    #[test]
    fn reinsert_replaces_in_place() {
        let mut store = KeyStore::default();
        store.insert(first());
        store.insert(second());
        let mut again = first();
        again.comment = "renamed".to_string();
        store.insert(again);

        assert_eq!(store.len(), 2);
        let comments: Vec<&str> = store.iter().map(|e| e.comment.as_str()).collect();
        assert_eq!(comments, ["renamed", "second"]);
    }

    #[test]
    fn remove_by_fingerprint() {
        let mut store = KeyStore::default();
        let e = first();
        let fp = e.fingerprint.clone();
        store.insert(e);
        store.insert(second());

        assert!(store.remove(&fp));
        assert!(!store.remove(&fp));
        assert!(store.get_by_fingerprint(&fp).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_empties_store() {
        let mut store = KeyStore::default();
        store.insert(first());
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn debug_omits_private_key() {
        let debug = format!("{:?}", first());
        assert!(debug.contains("first"));
        assert!(!debug.contains("private_key"));
    }
}
