//! SSH agent session and listener.

use std::io;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Context as _;
use signature::Signer as _;
use ssh_agent_lib::agent::{Session, listen};
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{AddIdentity, Credential, Identity, RemoveIdentity, SignRequest};
use ssh_key::{HashAlg, PrivateKey, Signature};
use tracing::{debug, info};

use crate::keystore::{KeyStore, build_entry};

/// Top-level SSH agent.  Cloned per incoming connection by `ssh_agent_lib`.
#[derive(Clone, Debug)]
pub struct SshAgent {
    store: Arc<RwLock<KeyStore>>,
    socket_path: PathBuf,
}

impl SshAgent {
    pub fn new(store: Arc<RwLock<KeyStore>>, socket_path: PathBuf) -> Self {
        Self { store, socket_path }
    }

    /// Bind the Unix socket and start accepting connections.
    pub async fn listen(self) -> anyhow::Result<()> {
        let listener = tokio::net::UnixListener::bind(&self.socket_path)
            .with_context(|| format!("bind SSH agent socket {:?}", self.socket_path))?;

        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod 0600 {:?}", self.socket_path))?;

        info!(path = %self.socket_path.display(), "SSH agent listening");
        listen(listener, self).await.context("SSH agent listener")
    }
}

fn other_err(msg: impl Into<String>) -> AgentError {
    AgentError::other(io::Error::other(msg.into()))
}

#[ssh_agent_lib::async_trait]
impl Session for SshAgent {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let store = self
            .store
            .read()
            .map_err(|_| other_err("key store lock poisoned"))?;

        let identities: Vec<Identity> = store
            .iter()
            .map(|entry| Identity {
                pubkey: entry.private_key.public_key().key_data().clone(),
                comment: entry.comment.clone(),
            })
            .collect();

        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        let fingerprint = request.pubkey.fingerprint(HashAlg::Sha256).to_string();

        let store = self
            .store
            .read()
            .map_err(|_| other_err("key store lock poisoned"))?;

        let entry = store
            .get_by_fingerprint(&fingerprint)
            .ok_or_else(|| other_err("key not found"))?;

        debug!(
            fingerprint = %fingerprint,
            comment = %entry.comment,
            data_len = request.data.len(),
            "sign"
        );

        let signature = entry
            .private_key
            .try_sign(&request.data)
            .map_err(|e| other_err(format!("signing failed: {e}")))?;

        Ok(signature)
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        let (privkey, comment) = match identity.credential {
            Credential::Key { privkey, comment } => (privkey, comment),
            Credential::Cert { .. } => return Err(other_err("certificates are not supported")),
        };

        let private_key = PrivateKey::new(privkey, comment.clone())
            .map_err(|e| other_err(format!("invalid private key: {e}")))?;
        let entry = build_entry(private_key, comment);

        info!(fingerprint = %entry.fingerprint, comment = %entry.comment, "key added");

        self.store
            .write()
            .map_err(|_| other_err("key store lock poisoned"))?
            .insert(entry);
        Ok(())
    }

    async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
        let fingerprint = identity.pubkey.fingerprint(HashAlg::Sha256).to_string();

        let removed = self
            .store
            .write()
            .map_err(|_| other_err("key store lock poisoned"))?
            .remove(&fingerprint);

        if !removed {
            return Err(other_err("key not found"));
        }
        info!(fingerprint = %fingerprint, "key removed");
        Ok(())
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        let mut store = self
            .store
            .write()
            .map_err(|_| other_err("key store lock poisoned"))?;
        let count = store.len();
        store.clear();
        info!(count, "all keys removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn agent() -> SshAgent {
        SshAgent::new(KeyStore::new(), PathBuf::from("/nonexistent/agent.sock"))
    }

    fn add_request(pem: &str, comment: &str) -> AddIdentity {
        let key = PrivateKey::from_openssh(pem).unwrap();
        AddIdentity {
            credential: Credential::Key {
                privkey: key.key_data().clone(),
                comment: comment.to_string(),
            },
        }
    }

    const FIRST: &str = include_str!("../../keyload-core/testdata/ed25519.pem");
    const SECOND: &str = include_str!("../../keyload-core/testdata/ed25519_second.pem");

    #[tokio::test]
    async fn add_then_list() {
        let mut agent = agent();
        agent.add_identity(add_request(FIRST, "one")).await.unwrap();
        agent.add_identity(add_request(SECOND, "two")).await.unwrap();

        let ids = agent.request_identities().await.unwrap();
        let comments: Vec<&str> = ids.iter().map(|i| i.comment.as_str()).collect();
        assert_eq!(comments, ["one", "two"]);
    }

    #[tokio::test]
    async fn sign_with_added_key_verifies() {
        use signature::Verifier as _;

        let mut agent = agent();
        agent.add_identity(add_request(FIRST, "one")).await.unwrap();

        let public = PrivateKey::from_openssh(FIRST).unwrap().public_key().clone();
        let data = b"challenge".to_vec();
        let signature = agent
            .sign(SignRequest {
                pubkey: public.key_data().clone(),
                data: data.clone(),
                flags: 0,
            })
            .await
            .unwrap();

        signature::Verifier::verify(&public, &data, &signature).unwrap();
    }

    #[tokio::test]
    async fn sign_with_unknown_key_fails() {
        let mut agent = agent();
        let public = PrivateKey::from_openssh(FIRST).unwrap().public_key().clone();
        let result = agent
            .sign(SignRequest {
                pubkey: public.key_data().clone(),
                data: b"x".to_vec(),
                flags: 0,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn remove_identity_present_and_absent() {
        let mut agent = agent();
        agent.add_identity(add_request(FIRST, "one")).await.unwrap();
        let pubkey = PrivateKey::from_openssh(FIRST)
            .unwrap()
            .public_key()
            .key_data()
            .clone();

        agent
            .remove_identity(RemoveIdentity {
                pubkey: pubkey.clone(),
            })
            .await
            .unwrap();
        assert!(agent.request_identities().await.unwrap().is_empty());

        assert!(agent.remove_identity(RemoveIdentity { pubkey }).await.is_err());
    }

    #[tokio::test]
    async fn remove_all_clears_store() {
        let mut agent = agent();
        agent.add_identity(add_request(FIRST, "one")).await.unwrap();
        agent.add_identity(add_request(SECOND, "two")).await.unwrap();
        agent.remove_all_identities().await.unwrap();
        assert!(agent.request_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listen_binds_private_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let agent = SshAgent::new(KeyStore::new(), path.clone());
        let handle = tokio::spawn(agent.listen());

        let private = |p: &Path| {
            std::fs::metadata(p).is_ok_and(|m| m.permissions().mode() & 0o777 == 0o600)
        };
        for _ in 0..200 {
            if private(&path) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(private(&path));
        handle.abort();
    }
}
