//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use resilience::ResilienceConfig;
use saga::WorkerConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `json` for JSON log lines, anything else for text
/// - `DATABASE_URL`: PostgreSQL backend when set, in-memory otherwise
/// - `STORE_TIMEOUT_MS`: bound on every store read and write
/// - `REPLICA_INDEX` / `REPLICA_COUNT` / `WORKERS` / `POLL_INTERVAL_MS`: worker sharding
/// - `POOL_CAPACITY`, `QUEUE_DEPTH`, `BREAKER_THRESHOLD`, `BREAKER_MIN_SAMPLES`,
///   `BREAKER_WINDOW_MS`, `COOL_DOWN_MS`, `PROBE_COUNT`: resilience settings
///
/// Unparsable values fall back to their default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub store_timeout: Duration,
    pub worker: WorkerConfig,
    pub resilience: ResilienceConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |name: &str, default: Duration| {
            parsed(name).map(Duration::from_millis).unwrap_or(default)
        };

        let worker = WorkerConfig {
            replica_index: parse_or(&lookup, "REPLICA_INDEX", defaults.worker.replica_index),
            replica_count: parse_or(&lookup, "REPLICA_COUNT", defaults.worker.replica_count),
            workers: parse_or(&lookup, "WORKERS", defaults.worker.workers),
            poll_interval: millis("POLL_INTERVAL_MS", defaults.worker.poll_interval),
        };

        let base = defaults.resilience;
        let resilience = ResilienceConfig {
            pool_capacity: parse_or(&lookup, "POOL_CAPACITY", base.pool_capacity),
            queue_depth: parse_or(&lookup, "QUEUE_DEPTH", base.queue_depth),
            breaker_threshold: parse_or(&lookup, "BREAKER_THRESHOLD", base.breaker_threshold),
            breaker_min_samples: parse_or(&lookup, "BREAKER_MIN_SAMPLES", base.breaker_min_samples),
            breaker_window: millis("BREAKER_WINDOW_MS", base.breaker_window),
            cool_down: millis("COOL_DOWN_MS", base.cool_down),
            probe_count: parse_or(&lookup, "PROBE_COUNT", base.probe_count),
            ..base
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "PORT", defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: lookup("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            store_timeout: millis("STORE_TIMEOUT_MS", defaults.store_timeout),
            worker,
            resilience,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    lookup(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,
            store_timeout: Duration::from_secs(2),
            worker: WorkerConfig::default(),
            resilience: ResilienceConfig::default(),
        }
    }
}
