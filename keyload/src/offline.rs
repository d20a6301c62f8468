use async_trait::async_trait;
use keyload_core::{AddedKey, Agent, AgentError, AgentKey, PublicKeyDescriptor};

/// Stand-in for an agent that could not be reached.
///
/// Lets store-only commands (`list`, `add`, `remove`) run without a daemon.
/// Every agent operation fails with the original connection error.
pub struct OfflineAgent {
    reason: String,
}

impl OfflineAgent {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Agent for OfflineAgent {
    async fn list(&self) -> Result<Vec<AgentKey>, AgentError> {
        Err(AgentError::Unavailable(self.reason.clone()))
    }

    async fn add(&self, _key: AddedKey) -> Result<(), AgentError> {
        Err(AgentError::Unavailable(self.reason.clone()))
    }

    async fn remove(&self, _key: &PublicKeyDescriptor) -> Result<(), AgentError> {
        Err(AgentError::Unavailable(self.reason.clone()))
    }
}
