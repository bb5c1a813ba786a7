//! Resilience configuration passed explicitly to each manager.

use std::collections::HashMap;
use std::time::Duration;

use common::ServicePair;

/// Capacity of one bulkhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Maximum concurrent in-flight calls.
    pub capacity: usize,
    /// Maximum callers allowed to wait for a slot; further callers are rejected immediately.
    pub queue_depth: usize,
}

/// Pool and breaker settings for one manager instance.
///
/// There is no process-wide default: every `ResourcePoolManager` and
/// `CircuitBreakerManager` receives its own copy at construction.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub pool_capacity: usize,
    pub queue_depth: usize,
    /// Error rate (0.0..=1.0) that must be exceeded to open a breaker.
    pub breaker_threshold: f64,
    /// Minimum calls in the current window before the error rate is evaluated.
    pub breaker_min_samples: u32,
    pub breaker_window: Duration,
    pub cool_down: Duration,
    /// Concurrent probes admitted while HALF_OPEN.
    pub probe_count: u32,
    /// Retries after a conflicted outcome report before the update is dropped.
    pub report_max_retries: u32,
    /// Leases held longer than this are reclaimed by `reap_expired`.
    pub lease_ttl: Duration,
    /// Per-pair pool sizes overriding `pool_capacity` / `queue_depth`.
    pub pool_overrides: HashMap<ServicePair, PoolLimits>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 10,
            queue_depth: 20,
            breaker_threshold: 0.5,
            breaker_min_samples: 10,
            breaker_window: Duration::from_secs(60),
            cool_down: Duration::from_secs(30),
            probe_count: 3,
            report_max_retries: 3,
            lease_ttl: Duration::from_secs(300),
            pool_overrides: HashMap::new(),
        }
    }
}

impl ResilienceConfig {
    /// Returns the pool limits for a pair, honouring overrides.
    pub fn pool_limits(&self, pair: &ServicePair) -> PoolLimits {
        self.pool_overrides
            .get(pair)
            .copied()
            .unwrap_or(PoolLimits {
                capacity: self.pool_capacity,
                queue_depth: self.queue_depth,
            })
    }

    /// Sizes the pool of one pair independently of the defaults.
    pub fn with_pool_override(mut self, pair: ServicePair, limits: PoolLimits) -> Self {
        self.pool_overrides.insert(pair, limits);
        self
    }
}
