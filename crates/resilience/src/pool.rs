//! Resource pool manager: one bulkhead per (source, destination) pair.
//!
//! Each pair owns an independent semaphore, wait counter and lease table.
//! The pair map lock is only held to look up or create a bulkhead, never
//! while waiting for a slot, so an exhausted pool cannot block acquisition
//! on any other pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{LeaseId, ServiceId, ServicePair};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{PoolLimits, ResilienceConfig};
use crate::error::PoolError;

/// Utilization snapshot of one bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pair: ServicePair,
    pub capacity: usize,
    pub in_use: usize,
    pub queue_depth: usize,
    pub waiting: usize,
}

struct ActiveLease {
    acquired_at: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

struct Bulkhead {
    pair: ServicePair,
    limits: PoolLimits,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    leases: Mutex<HashMap<LeaseId, ActiveLease>>,
}

impl Bulkhead {
    fn new(pair: ServicePair, limits: PoolLimits) -> Self {
        Self {
            pair,
            limits,
            semaphore: Arc::new(Semaphore::new(limits.capacity)),
            waiting: AtomicUsize::new(0),
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn in_use(&self) -> usize {
        self.limits
            .capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            pair: self.pair.clone(),
            capacity: self.limits.capacity,
            in_use: self.in_use(),
            queue_depth: self.limits.queue_depth,
            waiting: self.waiting.load(Ordering::SeqCst),
        }
    }

    fn publish_gauges(&self) {
        let source = self.pair.source.to_string();
        let destination = self.pair.destination.to_string();
        metrics::gauge!(
            "resource_pool_in_use",
            "source" => source.clone(),
            "destination" => destination.clone()
        )
        .set(self.in_use() as f64);
        metrics::gauge!(
            "resource_pool_waiting",
            "source" => source,
            "destination" => destination
        )
        .set(self.waiting.load(Ordering::SeqCst) as f64);
    }

    /// Frees the slot held by a lease. Unknown or already-freed leases are ignored.
    fn release(&self, lease_id: LeaseId) -> bool {
        let removed = self
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&lease_id);
        // Dropping the entry drops its permit.
        let released = removed.is_some();
        if released {
            self.publish_gauges();
        }
        released
    }

    fn reap_older_than(&self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let before = leases.len();
        leases.retain(|_, lease| now.signed_duration_since(lease.acquired_at) < ttl);
        before - leases.len()
    }
}

/// Decrements the wait counter when a queued acquirer gives up or gets a slot.
struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A slot in a pair's pool.
///
/// The slot is returned when the lease is released through the manager, when
/// it is dropped, or when it outlives the configured TTL.
pub struct Lease {
    id: LeaseId,
    pair: ServicePair,
    acquired_at: DateTime<Utc>,
    bulkhead: Arc<Bulkhead>,
}

impl Lease {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn pair(&self) -> &ServicePair {
        &self.pair
    }

    pub fn source(&self) -> &ServiceId {
        &self.pair.source
    }

    pub fn destination(&self) -> &ServiceId {
        &self.pair.destination
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("pair", &self.pair)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.bulkhead.release(self.id);
    }
}

/// Bounds concurrent in-flight calls per (source, destination) pair.
pub struct ResourcePoolManager {
    config: ResilienceConfig,
    pools: RwLock<HashMap<ServicePair, Arc<Bulkhead>>>,
}

impl ResourcePoolManager {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            pools: RwLock::new(HashMap::new()),
        }
    }

    fn bulkhead(&self, pair: &ServicePair) -> Arc<Bulkhead> {
        if let Some(existing) = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pair)
        {
            return existing.clone();
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        pools
            .entry(pair.clone())
            .or_insert_with(|| {
                let limits = self.config.pool_limits(pair);
                tracing::debug!(%pair, capacity = limits.capacity, queue_depth = limits.queue_depth, "created bulkhead");
                Arc::new(Bulkhead::new(pair.clone(), limits))
            })
            .clone()
    }

    /// Waits up to `max_wait` for a free slot in the pool of this pair.
    ///
    /// Fails immediately with `POOL_EXHAUSTED` when the pool is full and its
    /// wait queue is already at `queue_depth`.
    pub async fn acquire(
        &self,
        source: &ServiceId,
        destination: &ServiceId,
        max_wait: Duration,
    ) -> Result<Lease, PoolError> {
        let pair = ServicePair::new(source.clone(), destination.clone());
        let bulkhead = self.bulkhead(&pair);

        let permit = match bulkhead.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let queued = bulkhead.waiting.fetch_add(1, Ordering::SeqCst);
                let _guard = WaitGuard(&bulkhead.waiting);
                if queued >= bulkhead.limits.queue_depth {
                    return Err(self.exhausted(&bulkhead, Duration::ZERO));
                }
                bulkhead.publish_gauges();

                match tokio::time::timeout(max_wait, bulkhead.semaphore.clone().acquire_owned())
                    .await
                {
                    Ok(Ok(permit)) => permit,
                    _ => return Err(self.exhausted(&bulkhead, max_wait)),
                }
            }
        };

        let lease = Lease {
            id: LeaseId::new(),
            pair,
            acquired_at: Utc::now(),
            bulkhead: bulkhead.clone(),
        };
        bulkhead
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                lease.id,
                ActiveLease {
                    acquired_at: lease.acquired_at,
                    _permit: permit,
                },
            );
        bulkhead.publish_gauges();

        Ok(lease)
    }

    fn exhausted(&self, bulkhead: &Bulkhead, waited: Duration) -> PoolError {
        metrics::counter!(
            "resource_pool_rejections_total",
            "source" => bulkhead.pair.source.to_string(),
            "destination" => bulkhead.pair.destination.to_string()
        )
        .increment(1);
        tracing::warn!(pair = %bulkhead.pair, ?waited, "resource pool exhausted");
        PoolError::Exhausted {
            pair: bulkhead.pair.clone(),
            waited,
        }
    }

    /// Returns the slot held by `lease`.
    ///
    /// Releasing an already-released or expired lease is a no-op.
    pub fn release(&self, lease: &Lease) {
        if !lease.bulkhead.release(lease.id) {
            tracing::trace!(lease_id = %lease.id, "lease already released");
        }
    }

    /// Returns the utilization of one pair, if its pool has been created.
    pub fn stats(&self, source: &ServiceId, destination: &ServiceId) -> Option<PoolStats> {
        let pair = ServicePair::new(source.clone(), destination.clone());
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pair)
            .map(|b| b.stats())
    }

    /// Returns the utilization of every pool, ordered by pair.
    pub fn all_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|b| b.stats())
            .collect();
        stats.sort_by(|a, b| a.pair.cmp(&b.pair));
        stats
    }

    /// Frees every lease held longer than the configured TTL.
    ///
    /// Returns the number of leases reclaimed.
    pub fn reap_expired(&self) -> usize {
        let bulkheads: Vec<_> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let now = Utc::now();
        let mut reaped = 0;
        for bulkhead in bulkheads {
            let n = bulkhead.reap_older_than(self.config.lease_ttl, now);
            if n > 0 {
                tracing::warn!(pair = %bulkhead.pair, reaped = n, "reclaimed expired leases");
                bulkhead.publish_gauges();
            }
            reaped += n;
        }
        reaped
    }
}
