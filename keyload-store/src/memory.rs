use std::collections::HashMap;

use async_trait::async_trait;
use keyload_core::{PersistentStore, StoreError};
use serde_json::Value;
use tokio::sync::RwLock;

/// In-memory store.  Contents are lost when the value is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn set(&self, entries: HashMap<String, Value>) -> Result<(), StoreError> {
        self.data.write().await.extend(entries);
        Ok(())
    }

    async fn get(&self) -> Result<HashMap<String, Value>, StoreError> {
        Ok(self.data.read().await.clone())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }
}
