//! An in-memory key-value backend

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use weixin_clock::DurationSecs;

use super::KeyValueStore;
use crate::error::BoxError;

/// A process-local key-value store
///
/// Backend TTLs are ignored; expiry is tracked by the records themselves.
#[derive(Default, Debug)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    /// Constructs a new, empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        _ttl: Option<DurationSecs>,
    ) -> Result<(), BoxError> {
        self.entries
            .write()
            .await
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}
