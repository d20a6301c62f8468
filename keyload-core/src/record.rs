//! On-store representation of configured keys.
//!
//! Each configured key is one entry in the flat store namespace, keyed
//! `key.<id>`, holding `{"id", "name", "pemPrivateKey"}`.  The PEM text is
//! stored exactly as supplied; it is never decrypted at rest.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use crate::{ConfiguredKey, KeyId, pem};

/// Prefix of every storage key holding a configured key record.
pub const KEY_PREFIX: &str = "key.";

/// Storage key for the record of `id`.
pub fn storage_key(id: &KeyId) -> String {
    format!("{KEY_PREFIX}{id}")
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StoredKey {
    pub id: KeyId,
    pub name: String,
    #[serde(rename = "pemPrivateKey")]
    pub pem_private_key: Zeroizing<String>,
}

impl std::fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pem_private_key", &"[redacted]")
            .finish()
    }
}

impl StoredKey {
    pub fn new(id: KeyId, name: impl Into<String>, pem_private_key: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            pem_private_key: Zeroizing::new(pem_private_key.into()),
        }
    }

    pub fn encrypted(&self) -> bool {
        pem::is_encrypted(&self.pem_private_key)
    }

    pub fn to_configured(&self) -> ConfiguredKey {
        ConfiguredKey {
            id: self.id.clone(),
            name: self.name.clone(),
            encrypted: self.encrypted(),
        }
    }

    /// The single store entry that persists this record.
    pub fn to_entry(&self) -> Result<(String, serde_json::Value), serde_json::Error> {
        Ok((storage_key(&self.id), serde_json::to_value(self)?))
    }
}

/// Extract every configured key record from a full store snapshot, paired
/// with the storage key it was found under.
///
/// Entries outside the `key.` namespace are ignored.  Entries inside it that
/// do not decode as a record are skipped with a warning so one damaged entry
/// does not hide the rest.
pub fn collect(data: HashMap<String, serde_json::Value>) -> Vec<(String, StoredKey)> {
    data.into_iter()
        .filter(|(k, _)| k.starts_with(KEY_PREFIX))
        .filter_map(|(k, v)| match serde_json::from_value::<StoredKey>(v) {
            Ok(record) => Some((k, record)),
            Err(e) => {
                warn!(storage_key = %k, "skipping malformed key record: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn storage_key_uses_prefix() {
        assert_eq!(storage_key(&KeyId::new("77")), "key.77");
    }

    #[test]
    fn record_uses_wire_field_names() {
        let record = StoredKey::new(KeyId::new("1"), "work", "PEM");
        let (key, value) = record.to_entry().unwrap();
        assert_eq!(key, "key.1");
        assert_eq!(value, json!({"id": "1", "name": "work", "pemPrivateKey": "PEM"}));
    }

    #[test]
    fn debug_redacts_pem() {
        let record = StoredKey::new(KeyId::new("1"), "work", "-----BEGIN SECRET-----");
        let debug = format!("{record:?}");
        assert!(debug.contains("[redacted]"));
        assert!(!debug.contains("BEGIN SECRET"));
    }

    #[test]
    fn collect_filters_namespace_and_skips_malformed() {
        let mut data = HashMap::new();
        data.insert(
            "key.1".to_string(),
            json!({"id": "1", "name": "a", "pemPrivateKey": "x"}),
        );
        data.insert(
            "key.2".to_string(),
            json!({"id": "2", "name": "b", "pemPrivateKey": "y"}),
        );
        data.insert("settings".to_string(), json!({"theme": "dark"}));
        data.insert("keyring".to_string(), json!("not a record"));
        data.insert("key.3".to_string(), json!(42));
        data.insert("key.4".to_string(), json!({"id": "4"}));

        let mut records = collect(data);
        records.sort_by(|a, b| a.0.cmp(&b.0));
        let keys: Vec<&str> = records.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["key.1", "key.2"]);
        assert_eq!(records[1].1.id, KeyId::new("2"));
        assert_eq!(records[1].1.name, "b");
        assert_eq!(records[1].1.pem_private_key.as_str(), "y");
    }

    #[test]
    fn configured_view_derives_encryption() {
        let plain = StoredKey::new(KeyId::new("1"), "plain", include_str!("../testdata/ed25519.pem"));
        let locked = StoredKey::new(
            KeyId::new("2"),
            "locked",
            include_str!("../testdata/rsa_legacy_encrypted.pem"),
        );
        assert_eq!(
            plain.to_configured(),
            ConfiguredKey {
                id: KeyId::new("1"),
                name: "plain".to_string(),
                encrypted: false
            }
        );
        assert!(locked.to_configured().encrypted);
    }
}
