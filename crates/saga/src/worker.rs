//! Sharded worker pool resuming saga instances owned by this replica.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::InstanceId;
use futures_util::{StreamExt, stream};
use state_store::VersionedStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::invoker::StepInvoker;
use crate::orchestrator::SagaOrchestrator;

/// Which instances a replica owns: `id % replica_count == replica_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardAssignment {
    replica_index: u32,
    replica_count: u32,
}

impl ShardAssignment {
    pub fn new(replica_index: u32, replica_count: u32) -> Self {
        let replica_count = replica_count.max(1);
        Self {
            replica_index: replica_index % replica_count,
            replica_count,
        }
    }

    /// A single replica owning every instance.
    pub fn single() -> Self {
        Self::new(0, 1)
    }

    pub fn replica_index(&self) -> u32 {
        self.replica_index
    }

    pub fn replica_count(&self) -> u32 {
        self.replica_count
    }

    /// The replica index owning `id` among `replica_count` replicas.
    pub fn shard_of(id: InstanceId, replica_count: u32) -> u32 {
        let count = u128::from(replica_count.max(1));
        // The remainder is below `replica_count`, so it fits.
        (id.as_uuid().as_u128() % count) as u32
    }

    pub fn owns(&self, id: InstanceId) -> bool {
        Self::shard_of(id, self.replica_count) == self.replica_index
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub replica_index: u32,
    pub replica_count: u32,
    /// Instances driven concurrently.
    pub workers: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            replica_index: 0,
            replica_count: 1,
            workers: 8,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn shard(&self) -> ShardAssignment {
        ShardAssignment::new(self.replica_index, self.replica_count)
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Instances in this replica's shard.
    pub owned: usize,
    /// Non-terminal instances driven to a terminal state.
    pub resumed: usize,
    /// Instances whose run returned an error; retried on the next sweep.
    pub failed: usize,
    /// Owned instances seen terminal on an earlier sweep and not reloaded.
    pub skipped: usize,
}

enum Swept {
    Finished,
    Resumed { terminal: bool },
    Failed,
}

/// Drives every non-terminal instance of one shard.
///
/// Each worker is bound to one instance at a time and runs its steps
/// sequentially; up to `workers` instances progress concurrently.
pub struct WorkerPool<S, I> {
    orchestrator: Arc<SagaOrchestrator<S, I>>,
    config: WorkerConfig,
    /// Terminal states are final, so these ids never need loading again.
    finished: Mutex<HashSet<InstanceId>>,
}

impl<S, I> WorkerPool<S, I>
where
    S: VersionedStore + Clone + 'static,
    I: StepInvoker + 'static,
{
    pub fn new(orchestrator: Arc<SagaOrchestrator<S, I>>, config: WorkerConfig) -> Self {
        Self {
            orchestrator,
            config,
            finished: Mutex::new(HashSet::new()),
        }
    }

    pub fn shard(&self) -> ShardAssignment {
        self.config.shard()
    }

    /// Resumes every owned, non-terminal instance once.
    #[tracing::instrument(skip(self), fields(replica = self.config.replica_index))]
    pub async fn run_once(&self) -> Result<SweepReport> {
        let shard = self.shard();
        let owned: HashSet<InstanceId> = self
            .orchestrator
            .repository()
            .list_ids()
            .await?
            .into_iter()
            .filter(|id| shard.owns(*id))
            .collect();

        let pending: Vec<InstanceId> = {
            let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
            finished.retain(|id| owned.contains(id));
            owned
                .iter()
                .copied()
                .filter(|id| !finished.contains(id))
                .collect()
        };

        let outcomes: Vec<(InstanceId, Swept)> = stream::iter(pending.iter().copied())
            .map(|id| Self::sweep_one(self.orchestrator.clone(), id))
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut report = SweepReport {
            owned: owned.len(),
            skipped: owned.len() - pending.len(),
            ..SweepReport::default()
        };
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, outcome) in outcomes {
            match outcome {
                Swept::Finished => {
                    finished.insert(id);
                }
                Swept::Resumed { terminal } => {
                    report.resumed += 1;
                    if terminal {
                        finished.insert(id);
                    }
                }
                Swept::Failed => report.failed += 1,
            }
        }
        drop(finished);

        if report.resumed > 0 || report.failed > 0 {
            tracing::info!(
                owned = report.owned,
                resumed = report.resumed,
                failed = report.failed,
                "saga sweep finished"
            );
        }
        metrics::gauge!("saga_worker_owned_instances").set(report.owned as f64);
        Ok(report)
    }

    async fn sweep_one(
        orchestrator: Arc<SagaOrchestrator<S, I>>,
        id: InstanceId,
    ) -> (InstanceId, Swept) {
        let swept = match orchestrator.get_saga_status(id).await {
            Ok(status) if status.state.is_terminal() => Swept::Finished,
            Ok(_) => match orchestrator.run(id).await {
                Ok(status) => Swept::Resumed {
                    terminal: status.state.is_terminal(),
                },
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %e, "saga run failed, will retry");
                    Swept::Failed
                }
            },
            Err(e) => {
                tracing::warn!(instance_id = %id, error = %e, "failed to load saga");
                Swept::Failed
            }
        };
        (id, swept)
    }

    /// Sweeps every `poll_interval` until `shutdown` turns true or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                replica_index = self.config.replica_index,
                replica_count = self.config.replica_count,
                workers = self.config.workers,
                "saga worker pool started"
            );
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::warn!(error = %e, "saga sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("saga worker pool stopped");
        })
    }
}
