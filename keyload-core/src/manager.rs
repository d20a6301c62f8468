//! Key manager: configured keys in a [`PersistentStore`], loaded keys in an
//! [`Agent`].
//!
//! The manager holds no state of its own.  Every operation reads what it
//! needs from the store or the agent, so keys loaded or unloaded by other
//! agent clients, or lost when the agent restarts, are always reflected.
//!
//! # Concurrency
//!
//! Operations take no locks of their own.  Each store call is atomic, which
//! makes concurrent `add`s safe (they write distinct storage keys).
//! `remove` enumerates and then deletes in two calls; a writer that
//! re-creates the same id in between is not detected.  Ids are never reused,
//! so this needs a caller deliberately writing a record with an existing id.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::record::{self, StoredKey};
use crate::{
    AddedKey, Agent, AgentError, ConfiguredKey, KeyId, LoadedKey, PersistentStore,
    PublicKeyDescriptor, StoreError, identity, pem,
};

#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to find key with ID {0}")]
    NotFound(KeyId),
    #[error("failed to generate new ID: {0}")]
    IdGeneration(String),
    #[error("failed to {context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("failed to parse private key: {0}")]
    Parse(#[source] pem::ParseError),
    #[error("failed to {context}: {source}")]
    Agent {
        context: &'static str,
        #[source]
        source: AgentError,
    },
}

impl ManagerError {
    fn store(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { context, source }
    }

    fn agent(context: &'static str) -> impl FnOnce(AgentError) -> Self {
        move |source| Self::Agent { context, source }
    }
}

/// Manages configured keys and loads them into an SSH agent.
#[derive(Clone)]
pub struct KeyManager {
    agent: Arc<dyn Agent>,
    store: Arc<dyn PersistentStore>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager").finish_non_exhaustive()
    }
}

impl KeyManager {
    pub fn new(agent: Arc<dyn Agent>, store: Arc<dyn PersistentStore>) -> Self {
        Self { agent, store }
    }

    /// All configured keys, in no particular order.
    pub async fn configured(&self) -> Result<Vec<ConfiguredKey>, ManagerError> {
        let records = self.read_keys("read keys").await?;
        Ok(records.iter().map(|(_, k)| k.to_configured()).collect())
    }

    /// Configure a new key and return its freshly generated id.
    ///
    /// `pem_private_key` is stored verbatim and is not validated here; a bad
    /// key is reported when it is loaded.
    pub async fn add(&self, name: &str, pem_private_key: &str) -> Result<KeyId, ManagerError> {
        if name.is_empty() {
            return Err(ManagerError::InvalidInput("name must not be empty".into()));
        }

        let id = identity::generate().map_err(|e| ManagerError::IdGeneration(e.to_string()))?;
        let record = StoredKey::new(id.clone(), name, pem_private_key);
        let (storage_key, value) = record.to_entry().map_err(|e| ManagerError::Store {
            context: "encode key record",
            source: e.into(),
        })?;

        self.store
            .set(HashMap::from([(storage_key, value)]))
            .await
            .map_err(ManagerError::store("write key"))?;

        info!(id = %id, name, encrypted = record.encrypted(), "configured key");
        Ok(id)
    }

    /// Delete the configured key `id`.
    ///
    /// Deleting an id that does not exist succeeds.  Should several records
    /// carry the same id, all of them are deleted.
    pub async fn remove(&self, id: &KeyId) -> Result<(), ManagerError> {
        let storage_keys: Vec<String> = self
            .read_keys("enumerate keys")
            .await?
            .into_iter()
            .filter(|(_, k)| &k.id == id)
            .map(|(storage_key, _)| storage_key)
            .collect();

        if storage_keys.is_empty() {
            debug!(id = %id, "remove: no such key");
            return Ok(());
        }

        self.store
            .delete(&storage_keys)
            .await
            .map_err(ManagerError::store("delete keys"))?;

        info!(id = %id, count = storage_keys.len(), "removed key");
        Ok(())
    }

    /// Keys currently held by the agent, in the order it reports them.
    pub async fn loaded(&self) -> Result<Vec<LoadedKey>, ManagerError> {
        let keys = self
            .agent
            .list()
            .await
            .map_err(ManagerError::agent("list loaded keys"))?;

        Ok(keys
            .into_iter()
            .map(|k| LoadedKey::new(k.format, &k.blob, k.comment))
            .collect())
    }

    /// Decrypt the configured key `id` and load it into the agent.
    ///
    /// `passphrase` is used only when the stored key is encrypted.
    pub async fn load(&self, id: &KeyId, passphrase: &str) -> Result<(), ManagerError> {
        let record = self
            .read_key(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.clone()))?;

        let private_key = if record.encrypted() {
            let passphrase = Zeroizing::new(passphrase.as_bytes().to_vec());
            pem::parse_private_key(&record.pem_private_key, Some(passphrase.as_slice()))
        } else {
            pem::parse_private_key(&record.pem_private_key, None)
        }
        .map_err(ManagerError::Parse)?;

        self.agent
            .add(AddedKey {
                private_key,
                comment: identity::encode(id),
            })
            .await
            .map_err(ManagerError::agent("add key to agent"))?;

        info!(id = %id, name = %record.name, "loaded key into agent");
        Ok(())
    }

    /// Remove a loaded key from the agent.
    ///
    /// The key is identified by its public half only; the comment is not
    /// consulted, so foreign keys can be unloaded too.
    pub async fn unload(&self, key: &LoadedKey) -> Result<(), ManagerError> {
        let descriptor = PublicKeyDescriptor {
            format: key.key_type.clone(),
            blob: key.blob(),
        };

        self.agent
            .remove(&descriptor)
            .await
            .map_err(ManagerError::agent("unload key"))?;

        debug!(key_type = %key.key_type, comment = %key.comment, "unloaded key");
        Ok(())
    }

    /// Every configured key record, paired with the storage key it was
    /// read from.
    async fn read_keys(
        &self,
        context: &'static str,
    ) -> Result<Vec<(String, StoredKey)>, ManagerError> {
        let data = self.store.get().await.map_err(ManagerError::store(context))?;
        Ok(record::collect(data))
    }

    async fn read_key(&self, id: &KeyId) -> Result<Option<StoredKey>, ManagerError> {
        Ok(self
            .read_keys("read key")
            .await?
            .into_iter()
            .map(|(_, k)| k)
            .find(|k| &k.id == id))
    }
}
