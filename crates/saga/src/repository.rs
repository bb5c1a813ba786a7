//! Persistence of saga instances and cancellation requests.

use common::InstanceId;
use state_store::{Version, VersionedStore, VersionedStoreExt};

use crate::error::{Result, SagaError};
use crate::instance::SagaInstance;

const INSTANCE_PREFIX: &str = "saga/";
const CANCEL_PREFIX: &str = "saga-cancel/";

/// Reads and writes instances with optimistic concurrency.
///
/// Cancellation requests live under their own keys so that a caller
/// cancelling never races the worker writing the instance.
#[derive(Debug, Clone)]
pub struct SagaRepository<S> {
    store: S,
}

impl<S: VersionedStore> SagaRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn key(id: InstanceId) -> String {
        format!("{INSTANCE_PREFIX}{id}")
    }

    fn cancel_key(id: InstanceId) -> String {
        format!("{CANCEL_PREFIX}{id}")
    }

    /// Loads an instance with the version it was read at.
    pub async fn load(&self, id: InstanceId) -> Result<Option<SagaInstance>> {
        let Some(stored) = self.store.get_as::<SagaInstance>(&Self::key(id)).await? else {
            return Ok(None);
        };
        let mut instance = stored.value;
        instance.set_version(stored.version);
        Ok(Some(instance))
    }

    /// Writes an instance conditioned on the version it was read at.
    ///
    /// A new instance (version 0) must not exist yet. On success the
    /// instance carries its new version.
    pub async fn save(&self, instance: &mut SagaInstance) -> Result<()> {
        let expected = instance.version();
        let accepted = self
            .store
            .put_as(&Self::key(instance.id()), &*instance, expected)
            .await?;

        if !accepted {
            metrics::counter!("saga_version_conflicts_total").increment(1);
            return Err(SagaError::ConcurrentModification {
                instance_id: instance.id(),
            });
        }
        instance.set_version(expected.next());
        Ok(())
    }

    /// Ids of every stored instance.
    pub async fn list_ids(&self) -> Result<Vec<InstanceId>> {
        let keys = self.store.list_keys(INSTANCE_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(INSTANCE_PREFIX)?.parse().ok())
            .collect())
    }

    /// Records a cancellation request. Repeated requests are no-ops.
    pub async fn request_cancel(&self, id: InstanceId) -> Result<()> {
        let marker = serde_json::json!({ "requested_at": chrono::Utc::now() });
        // A rejected write means the marker already exists.
        self.store
            .put_if_version(&Self::cancel_key(id), marker, Version::initial())
            .await?;
        Ok(())
    }

    pub async fn is_cancel_requested(&self, id: InstanceId) -> Result<bool> {
        Ok(self.store.exists(&Self::cancel_key(id)).await?)
    }
}
