use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Result, StoreError, Version, Versioned};

/// Core trait for versioned state stores.
///
/// Any storage engine offering an atomic compare-and-swap qualifies. All
/// implementations must be thread-safe (Send + Sync) because the same store is
/// shared by every worker of a replica.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Reads the current value and version of a key.
    ///
    /// Returns None if the key has never been written.
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Writes `value` only if the key is currently at `expected`.
    ///
    /// Use `Version::initial()` to create a key that must not exist yet.
    /// Returns `true` if the write was accepted, in which case the key is now
    /// at `expected.next()`. Returns `false` on a version mismatch.
    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Version,
    ) -> Result<bool>;

    /// Lists every key starting with `prefix`, in lexical order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Extension trait providing typed convenience methods for stores.
#[async_trait]
pub trait VersionedStoreExt: VersionedStore {
    /// Reads and deserializes a key.
    async fn get_as<T>(&self, key: &str) -> Result<Option<Versioned<T>>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(stored) => {
                let value = serde_json::from_value(stored.value)?;
                Ok(Some(Versioned::new(value, stored.version)))
            }
            None => Ok(None),
        }
    }

    /// Serializes and conditionally writes a key.
    async fn put_as<T>(&self, key: &str, value: &T, expected: Version) -> Result<bool>
    where
        T: Serialize + Sync,
    {
        let json = serde_json::to_value(value)?;
        self.put_if_version(key, json, expected).await
    }

    /// Checks whether a key has been written.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

// Blanket implementation for all VersionedStore implementations
impl<T: VersionedStore + ?Sized> VersionedStoreExt for T {}

#[async_trait]
impl<T: VersionedStore + ?Sized> VersionedStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        (**self).get(key).await
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Version,
    ) -> Result<bool> {
        (**self).put_if_version(key, value, expected).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list_keys(prefix).await
    }
}

/// Wraps a store so that no read or write blocks longer than `timeout`.
#[derive(Clone)]
pub struct TimedStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: VersionedStore> TimedStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn timed_out(&self, operation: &'static str, key: &str) -> StoreError {
        metrics::counter!("state_store_timeouts_total", "operation" => operation).increment(1);
        tracing::warn!(operation, key, timeout = ?self.timeout, "state store call timed out");
        StoreError::Timeout {
            operation,
            key: key.to_string(),
            after: self.timeout,
        }
    }
}

#[async_trait]
impl<S: VersionedStore> VersionedStore for TimedStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        tokio::time::timeout(self.timeout, self.inner.get(key))
            .await
            .map_err(|_| self.timed_out("get", key))?
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Version,
    ) -> Result<bool> {
        tokio::time::timeout(
            self.timeout,
            self.inner.put_if_version(key, value, expected),
        )
        .await
        .map_err(|_| self.timed_out("put_if_version", key))?
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        tokio::time::timeout(self.timeout, self.inner.list_keys(prefix))
            .await
            .map_err(|_| self.timed_out("list_keys", prefix))?
    }
}
