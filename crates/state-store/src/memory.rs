use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Result, Version, Versioned, store::VersionedStore};

/// In-memory state store implementation.
///
/// Provides the same compare-and-swap semantics as the PostgreSQL
/// implementation. Clones share the same underlying map, which is how tests
/// model several replicas pointing at one store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<RwLock<BTreeMap<String, Versioned>>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys stored.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if no key has been written.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Removes every record.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl VersionedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Version,
    ) -> Result<bool> {
        let mut records = self.records.write().await;

        let current = records
            .get(key)
            .map(|r| r.version)
            .unwrap_or(Version::initial());

        if current != expected {
            tracing::debug!(key, %expected, %current, "rejected stale write");
            return Ok(false);
        }

        records.insert(key.to_string(), Versioned::new(value, expected.next()));
        Ok(true)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let records = self.records.read().await;
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
