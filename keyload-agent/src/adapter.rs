//! [`keyload_core::Agent`] on top of any agent-protocol session.

use std::path::Path;

use async_trait::async_trait;
use keyload_core::{AddedKey, Agent, AgentError, AgentKey, PublicKeyDescriptor};
use ssh_agent_lib::agent::Session;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::proto::{AddIdentity, Credential, RemoveIdentity};
use ssh_key::PublicKey;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Drives an [`ssh_agent_lib`] session as a keyload agent.
///
/// With a [`Client`] this talks to a running agent over its socket; with an
/// [`crate::SshAgent`] it drives the in-process agent directly.
pub struct SessionAgent<S> {
    session: Mutex<S>,
}

impl<S: Session> SessionAgent<S> {
    pub fn new(session: S) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }
}

impl SessionAgent<Client<UnixStream>> {
    /// Connect to the agent listening on `path`.
    pub async fn connect(path: &Path) -> Result<Self, AgentError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| AgentError::Unavailable(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "connected to agent");
        Ok(Self::new(Client::new(stream)))
    }
}

fn refused(e: ssh_agent_lib::error::AgentError) -> AgentError {
    AgentError::Refused(e.to_string())
}

#[async_trait]
impl<S: Session> Agent for SessionAgent<S> {
    async fn list(&self) -> Result<Vec<AgentKey>, AgentError> {
        let identities = self
            .session
            .lock()
            .await
            .request_identities()
            .await
            .map_err(refused)?;

        identities
            .into_iter()
            .map(|identity| {
                let public_key = PublicKey::from(identity.pubkey);
                let blob = public_key
                    .to_bytes()
                    .map_err(|e| AgentError::Other(anyhow::anyhow!("encode public key: {e}")))?;
                Ok(AgentKey {
                    format: public_key.algorithm().as_str().to_string(),
                    blob,
                    comment: identity.comment,
                })
            })
            .collect()
    }

    async fn add(&self, key: AddedKey) -> Result<(), AgentError> {
        let request = AddIdentity {
            credential: Credential::Key {
                privkey: key.private_key.key_data().clone(),
                comment: key.comment,
            },
        };
        self.session
            .lock()
            .await
            .add_identity(request)
            .await
            .map_err(refused)
    }

    async fn remove(&self, key: &PublicKeyDescriptor) -> Result<(), AgentError> {
        let public_key = PublicKey::from_bytes(&key.blob)
            .map_err(|e| AgentError::Refused(format!("invalid {} public key: {e}", key.format)))?;
        let request = RemoveIdentity {
            pubkey: public_key.key_data().clone(),
        };
        self.session
            .lock()
            .await
            .remove_identity(request)
            .await
            .map_err(refused)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keyload_core::{KeyId, KeyManager, LoadedKey, ManagerError};
    use keyload_store::MemoryStore;

    use super::*;
    use crate::{KeyStore, SshAgent};

    const PLAIN: &str = include_str!("../../keyload-core/testdata/ed25519.pem");
    const ENCRYPTED: &str = include_str!("../../keyload-core/testdata/ed25519_encrypted.pem");

    fn in_process() -> SessionAgent<SshAgent> {
        SessionAgent::new(SshAgent::new(
            KeyStore::new(),
            std::path::PathBuf::from("/nonexistent/agent.sock"),
        ))
    }

    fn manager(agent: impl Agent + 'static) -> KeyManager {
        KeyManager::new(Arc::new(agent), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn list_reports_algorithm_and_wire_blob() {
        let agent = in_process();
        let private_key = ssh_key::PrivateKey::from_openssh(PLAIN).unwrap();
        agent
            .add(AddedKey {
                private_key: private_key.clone(),
                comment: "c".to_string(),
            })
            .await
            .unwrap();

        let keys = agent.list().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].format, "ssh-ed25519");
        assert_eq!(keys[0].blob, private_key.public_key().to_bytes().unwrap());
        assert_eq!(keys[0].comment, "c");
    }

    #[tokio::test]
    async fn remove_with_garbage_blob_is_refused() {
        let agent = in_process();
        let result = agent
            .remove(&PublicKeyDescriptor {
                format: "ssh-ed25519".to_string(),
                blob: vec![1, 2, 3],
            })
            .await;
        assert!(matches!(result, Err(AgentError::Refused(_))));
    }

    #[tokio::test]
    async fn connect_to_missing_socket_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let result = SessionAgent::connect(&dir.path().join("absent.sock")).await;
        assert!(matches!(result, Err(AgentError::Unavailable(_))));
    }

    #[tokio::test]
    async fn manager_end_to_end_in_process() {
        let manager = manager(in_process());

        // Two keys, one of them passphrase protected.
        let plain = manager.add("plain", PLAIN).await.unwrap();
        let locked = manager.add("locked", ENCRYPTED).await.unwrap();

        let mut configured = manager.configured().await.unwrap();
        configured.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(configured.len(), 2);
        assert_eq!(configured[0].name, "locked");
        assert!(configured[0].encrypted);
        assert_eq!(configured[1].name, "plain");
        assert!(!configured[1].encrypted);

        // Wrong passphrase leaves the agent untouched.
        assert!(matches!(
            manager.load(&locked, "wrong").await,
            Err(ManagerError::Parse(_))
        ));
        assert!(manager.loaded().await.unwrap().is_empty());

        manager.load(&plain, "").await.unwrap();
        manager.load(&locked, "hunter2").await.unwrap();

        let loaded = manager.loaded().await.unwrap();
        let ids: Vec<Option<KeyId>> = loaded.iter().map(LoadedKey::id).collect();
        assert_eq!(ids, [Some(plain.clone()), Some(locked.clone())]);

        manager.unload(&loaded[0]).await.unwrap();
        let remaining = manager.loaded().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), Some(locked.clone()));

        // Unloading a key the agent no longer holds is reported.
        assert!(matches!(
            manager.unload(&loaded[0]).await,
            Err(ManagerError::Agent { .. })
        ));

        // Removing the configuration does not touch the agent.
        manager.remove(&locked).await.unwrap();
        assert_eq!(manager.configured().await.unwrap().len(), 1);
        assert_eq!(manager.loaded().await.unwrap().len(), 1);

        assert!(matches!(
            manager.load(&locked, "hunter2").await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn manager_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let server = tokio::spawn(SshAgent::new(KeyStore::new(), path.clone()).listen());

        let mut agent = None;
        for _ in 0..200 {
            if let Ok(a) = SessionAgent::connect(&path).await {
                agent = Some(a);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let manager = manager(agent.unwrap());

        let id = manager.add("plain", PLAIN).await.unwrap();
        manager.load(&id, "").await.unwrap();

        let loaded = manager.loaded().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key_type, "ssh-ed25519");
        assert_eq!(loaded[0].id(), Some(id));

        manager.unload(&loaded[0]).await.unwrap();
        assert!(manager.loaded().await.unwrap().is_empty());

        server.abort();
    }
}
