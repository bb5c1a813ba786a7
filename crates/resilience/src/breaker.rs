//! Circuit breaker manager with state shared through a versioned store.
//!
//! Every (source, destination) pair has one `CircuitBreakerRecord`, read and
//! written by every replica that calls that destination. Writes are
//! read-compute-CAS loops; a lost race re-reads and recomputes, so replicas
//! converge without a lock manager.
//!
//! ```text
//! CLOSED ──(error rate > threshold over >= min samples)──► OPEN
//! OPEN ──(cool_down elapsed, next admit)──► HALF_OPEN
//! HALF_OPEN ──(every admitted probe succeeded)──► CLOSED
//! HALF_OPEN ──(any probe failed)──► OPEN
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{ServiceId, ServicePair};
use serde::{Deserialize, Serialize};
use state_store::{Version, VersionedStore, VersionedStoreExt};

use crate::config::ResilienceConfig;
use crate::error::BreakerError;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Health state of one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call priority. Only `Critical` bypasses a rejecting breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    #[default]
    Normal,
    /// Operator-initiated recovery actions only. Every use is audited.
    Critical,
}

/// Result of a finished call as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Why a call was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The breaker is OPEN and still cooling down.
    CircuitOpen,
    /// The breaker is HALF_OPEN and every probe slot is taken.
    ProbeLimitReached,
}

impl RejectReason {
    /// Failure code reported to callers. Both reasons surface as `CIRCUIT_OPEN`.
    pub fn code(&self) -> &'static str {
        "CIRCUIT_OPEN"
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::CircuitOpen => f.write_str("CIRCUIT_OPEN"),
            RejectReason::ProbeLimitReached => f.write_str("CIRCUIT_OPEN (probe limit reached)"),
        }
    }
}

/// Admission decision for one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit {
        /// The call is a HALF_OPEN recovery probe.
        probe: bool,
        /// The call was forced through by CRITICAL priority.
        overridden: bool,
    },
    Reject(RejectReason),
}

impl Admission {
    fn admit() -> Self {
        Admission::Admit {
            probe: false,
            overridden: false,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admit { .. })
    }

    /// True when the call holds one of the HALF_OPEN slots.
    pub fn is_trial(&self) -> bool {
        matches!(self, Admission::Admit { probe: true, .. })
    }
}

/// Shared breaker state for one (source, destination) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerRecord {
    pub state: BreakerState,
    pub error_count: u32,
    pub success_count: u32,
    pub window_start: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    /// HALF_OPEN probes admitted and not yet reported.
    #[serde(default)]
    pub probes_in_flight: u32,
    /// Store version this record was read at.
    #[serde(skip)]
    pub version: Version,
}

impl CircuitBreakerRecord {
    /// A fresh CLOSED record, as seen before any write.
    pub fn closed(now: DateTime<Utc>) -> Self {
        Self {
            state: BreakerState::Closed,
            error_count: 0,
            success_count: 0,
            window_start: now,
            last_transition_at: now,
            probes_in_flight: 0,
            version: Version::initial(),
        }
    }

    fn transition(&self, to: BreakerState, now: DateTime<Utc>) -> Self {
        Self {
            state: to,
            error_count: 0,
            success_count: 0,
            window_start: now,
            last_transition_at: now,
            probes_in_flight: 0,
            version: self.version,
        }
    }

    fn elapsed_since(&self, at: DateTime<Utc>, now: DateTime<Utc>, span: std::time::Duration) -> bool {
        let span = chrono::Duration::from_std(span).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(at) >= span
    }

    /// Fraction of failed calls in the current window.
    pub fn error_rate(&self) -> f64 {
        let total = self.error_count + self.success_count;
        if total == 0 {
            return 0.0;
        }
        f64::from(self.error_count) / f64::from(total)
    }

    /// Decides whether a call is admitted and which record, if any, must be written.
    pub fn decide(
        &self,
        config: &ResilienceConfig,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> (Admission, Option<Self>) {
        match self.state {
            BreakerState::Closed => (Admission::admit(), None),
            BreakerState::Open => {
                if self.elapsed_since(self.last_transition_at, now, config.cool_down) {
                    let mut half_open = self.transition(BreakerState::HalfOpen, now);
                    half_open.probes_in_flight = 1;
                    (
                        Admission::Admit {
                            probe: true,
                            overridden: false,
                        },
                        Some(half_open),
                    )
                } else if priority == Priority::Critical {
                    (
                        Admission::Admit {
                            probe: false,
                            overridden: true,
                        },
                        None,
                    )
                } else {
                    (Admission::Reject(RejectReason::CircuitOpen), None)
                }
            }
            BreakerState::HalfOpen => {
                // Probes that never reported (caller crashed) would otherwise
                // pin the breaker HALF_OPEN forever.
                if self.elapsed_since(self.last_transition_at, now, config.cool_down) {
                    let mut restarted = self.transition(BreakerState::HalfOpen, now);
                    restarted.probes_in_flight = 1;
                    return (
                        Admission::Admit {
                            probe: true,
                            overridden: false,
                        },
                        Some(restarted),
                    );
                }

                if self.probes_in_flight < config.probe_count {
                    let mut next = self.clone();
                    next.probes_in_flight += 1;
                    (
                        Admission::Admit {
                            probe: true,
                            overridden: false,
                        },
                        Some(next),
                    )
                } else if priority == Priority::Critical {
                    (
                        Admission::Admit {
                            probe: false,
                            overridden: true,
                        },
                        None,
                    )
                } else {
                    (Admission::Reject(RejectReason::ProbeLimitReached), None)
                }
            }
        }
    }

    /// Applies a call outcome, returning the record to write or None if nothing changes.
    ///
    /// `trial` marks a call that was admitted as a HALF_OPEN probe. Only those
    /// move a HALF_OPEN record; any other report in that state is ignored.
    pub fn apply_outcome(
        &self,
        config: &ResilienceConfig,
        outcome: CallOutcome,
        trial: bool,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        match self.state {
            BreakerState::Closed => {
                let mut next = self.clone();
                if self.elapsed_since(self.window_start, now, config.breaker_window) {
                    next.window_start = now;
                    next.error_count = 0;
                    next.success_count = 0;
                }
                match outcome {
                    CallOutcome::Success => next.success_count += 1,
                    CallOutcome::Failure => next.error_count += 1,
                }

                let samples = next.error_count + next.success_count;
                if samples >= config.breaker_min_samples
                    && next.error_rate() > config.breaker_threshold
                {
                    return Some(next.transition(BreakerState::Open, now));
                }
                Some(next)
            }
            // Late reports from calls admitted before the breaker opened.
            BreakerState::Open => None,
            BreakerState::HalfOpen if !trial => None,
            BreakerState::HalfOpen => match outcome {
                CallOutcome::Failure => Some(self.transition(BreakerState::Open, now)),
                CallOutcome::Success => {
                    let mut next = self.clone();
                    next.success_count += 1;
                    next.probes_in_flight = next.probes_in_flight.saturating_sub(1);
                    if next.probes_in_flight == 0 {
                        Some(next.transition(BreakerState::Closed, now))
                    } else {
                        Some(next)
                    }
                }
            },
        }
    }

    /// Hands back a HALF_OPEN slot whose call was never made.
    pub fn release_slot(&self) -> Option<Self> {
        if self.state != BreakerState::HalfOpen || self.probes_in_flight == 0 {
            return None;
        }
        let mut next = self.clone();
        next.probes_in_flight -= 1;
        Some(next)
    }
}

/// Decides admission per pair and folds call outcomes into the shared records.
pub struct CircuitBreakerManager<S> {
    store: S,
    config: ResilienceConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl<S: VersionedStore> CircuitBreakerManager<S> {
    pub fn new(store: S, config: ResilienceConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            store,
            config,
            telemetry,
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    fn key(pair: &ServicePair) -> String {
        format!("breaker/{}/{}", pair.source, pair.destination)
    }

    async fn load(&self, pair: &ServicePair) -> Result<CircuitBreakerRecord, BreakerError> {
        match self
            .store
            .get_as::<CircuitBreakerRecord>(&Self::key(pair))
            .await?
        {
            Some(stored) => {
                let mut record = stored.value;
                record.version = stored.version;
                Ok(record)
            }
            None => Ok(CircuitBreakerRecord::closed(Utc::now())),
        }
    }

    async fn store_record(
        &self,
        pair: &ServicePair,
        record: &CircuitBreakerRecord,
    ) -> Result<bool, BreakerError> {
        Ok(self
            .store
            .put_as(&Self::key(pair), record, record.version)
            .await?)
    }

    fn transitioned(&self, pair: &ServicePair, from: BreakerState, to: BreakerState) {
        if from == to {
            return;
        }
        metrics::counter!("circuit_breaker_transitions_total", "to" => to.as_str()).increment(1);
        match to {
            BreakerState::Open => tracing::warn!(%pair, %from, %to, "circuit breaker opened"),
            _ => tracing::info!(%pair, %from, %to, "circuit breaker transition"),
        }
        self.telemetry.emit(TelemetryEvent::BreakerTransition {
            pair: pair.clone(),
            from,
            to,
        });
    }

    /// Decides whether a call from `source` to `destination` may proceed.
    ///
    /// CRITICAL priority bypasses OPEN rejection. That can re-admit load onto
    /// a failing destination, so every override is logged under the `audit`
    /// target and emitted as a distinct telemetry event.
    #[tracing::instrument(skip(self), fields(source = %source, destination = %destination))]
    pub async fn admit(
        &self,
        source: &ServiceId,
        destination: &ServiceId,
        priority: Priority,
    ) -> Result<Admission, BreakerError> {
        let pair = ServicePair::new(source.clone(), destination.clone());
        let attempts = self.config.report_max_retries.max(1) + 1;

        for _ in 0..attempts {
            let record = self.load(&pair).await?;
            let (admission, update) = record.decide(&self.config, priority, Utc::now());

            if let Some(next) = &update {
                if !self.store_record(&pair, next).await? {
                    tracing::debug!(%pair, "breaker record changed during admission, re-reading");
                    continue;
                }
                self.transitioned(&pair, record.state, next.state);
            }

            self.record_admission(&pair, priority, record.state, admission);
            return Ok(admission);
        }

        Err(BreakerError::Contended { pair, attempts })
    }

    fn record_admission(
        &self,
        pair: &ServicePair,
        priority: Priority,
        state: BreakerState,
        admission: Admission,
    ) {
        let reason = match admission {
            Admission::Admit {
                overridden: true, ..
            } => {
                metrics::counter!("circuit_breaker_critical_overrides_total").increment(1);
                tracing::warn!(target: "audit", %pair, %state, "CRITICAL call forced through circuit breaker");
                self.telemetry.emit(TelemetryEvent::CriticalOverride {
                    pair: pair.clone(),
                    state,
                });
                None
            }
            Admission::Admit { .. } => {
                metrics::counter!("circuit_breaker_admitted_total").increment(1);
                None
            }
            Admission::Reject(reason) => {
                metrics::counter!("circuit_breaker_rejected_total").increment(1);
                tracing::debug!(%pair, %state, %reason, "call rejected by circuit breaker");
                Some(reason.to_string())
            }
        };

        self.telemetry.emit(TelemetryEvent::AdmitDecision {
            pair: pair.clone(),
            priority,
            state,
            admitted: admission.is_admitted(),
            reason,
        });
    }

    /// Folds one call outcome into the shared record.
    ///
    /// `admission` is what `admit` returned for the call, or `None` for calls
    /// that skipped admission (compensations). Version conflicts are retried
    /// up to `report_max_retries` times, after which the update is dropped:
    /// counters are best-effort.
    #[tracing::instrument(skip(self), fields(source = %source, destination = %destination))]
    pub async fn report(
        &self,
        source: &ServiceId,
        destination: &ServiceId,
        admission: Option<Admission>,
        outcome: CallOutcome,
    ) -> Result<(), BreakerError> {
        let pair = ServicePair::new(source.clone(), destination.clone());
        let trial = admission.is_some_and(|a| a.is_trial());
        let attempts = self.config.report_max_retries + 1;

        for _ in 0..attempts {
            let record = self.load(&pair).await?;
            let Some(next) = record.apply_outcome(&self.config, outcome, trial, Utc::now()) else {
                return Ok(());
            };

            if self.store_record(&pair, &next).await? {
                self.transitioned(&pair, record.state, next.state);
                return Ok(());
            }
        }

        metrics::counter!("circuit_breaker_reports_dropped_total").increment(1);
        tracing::warn!(%pair, ?outcome, attempts, "dropping breaker update after repeated conflicts");
        self.telemetry
            .emit(TelemetryEvent::ReportDropped { pair, attempts });
        Ok(())
    }

    /// Returns a HALF_OPEN slot taken by `admit` when the call never went out
    /// (pool rejection, deadline already spent). Without this the slot stays
    /// taken until the next cool-down restarts the HALF_OPEN round.
    #[tracing::instrument(skip(self), fields(source = %source, destination = %destination))]
    pub async fn release(
        &self,
        source: &ServiceId,
        destination: &ServiceId,
        admission: Admission,
    ) -> Result<(), BreakerError> {
        if !admission.is_trial() {
            return Ok(());
        }
        let pair = ServicePair::new(source.clone(), destination.clone());
        let attempts = self.config.report_max_retries + 1;

        for _ in 0..attempts {
            let record = self.load(&pair).await?;
            let Some(next) = record.release_slot() else {
                return Ok(());
            };
            if self.store_record(&pair, &next).await? {
                tracing::debug!(%pair, in_flight = next.probes_in_flight, "released unused HALF_OPEN slot");
                return Ok(());
            }
        }

        metrics::counter!("circuit_breaker_reports_dropped_total").increment(1);
        tracing::warn!(%pair, attempts, "dropping HALF_OPEN slot release after repeated conflicts");
        self.telemetry
            .emit(TelemetryEvent::ReportDropped { pair, attempts });
        Ok(())
    }

    /// Returns the current record of a pair (CLOSED if never written).
    pub async fn record(
        &self,
        source: &ServiceId,
        destination: &ServiceId,
    ) -> Result<CircuitBreakerRecord, BreakerError> {
        self.load(&ServicePair::new(source.clone(), destination.clone()))
            .await
    }

    /// Forces a pair back to CLOSED. Operator action.
    #[tracing::instrument(skip(self), fields(source = %source, destination = %destination))]
    pub async fn reset(&self, source: &ServiceId, destination: &ServiceId) -> Result<(), BreakerError> {
        let pair = ServicePair::new(source.clone(), destination.clone());
        let attempts = self.config.report_max_retries.max(1) + 1;

        for _ in 0..attempts {
            let record = self.load(&pair).await?;
            let closed = record.transition(BreakerState::Closed, Utc::now());
            if self.store_record(&pair, &closed).await? {
                tracing::warn!(target: "audit", %pair, from = %record.state, "circuit breaker manually reset");
                self.transitioned(&pair, record.state, BreakerState::Closed);
                return Ok(());
            }
        }

        Err(BreakerError::Contended { pair, attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::InMemorySink;
    use rejecting::RejectingStore;
    use state_store::InMemoryStore;
    use std::time::Duration;

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            breaker_threshold: 0.5,
            breaker_min_samples: 10,
            breaker_window: Duration::from_secs(60),
            cool_down: Duration::from_millis(50),
            probe_count: 3,
            ..ResilienceConfig::default()
        }
    }

    fn svc(name: &str) -> ServiceId {
        ServiceId::new(name)
    }

    fn manager(store: InMemoryStore) -> (CircuitBreakerManager<InMemoryStore>, InMemorySink) {
        let sink = InMemorySink::new();
        (
            CircuitBreakerManager::new(store, config(), Arc::new(sink.clone())),
            sink,
        )
    }

    async fn fail_n(breakers: &CircuitBreakerManager<InMemoryStore>, n: usize) {
        for _ in 0..n {
            breakers
                .report(&svc("orch"), &svc("x"), None, CallOutcome::Failure)
                .await
                .unwrap();
        }
    }

    // -- pure state machine --

    #[test]
    fn closed_admits_without_write() {
        let now = Utc::now();
        let (admission, update) =
            CircuitBreakerRecord::closed(now).decide(&config(), Priority::Normal, now);
        assert!(admission.is_admitted());
        assert!(update.is_none());
    }

    #[test]
    fn below_min_samples_never_trips() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(now);
        for _ in 0..9 {
            record = record
                .apply_outcome(&config(), CallOutcome::Failure, false, now)
                .unwrap();
        }
        assert_eq!(record.state, BreakerState::Closed);
        assert_eq!(record.error_count, 9);
    }

    #[test]
    fn error_rate_must_exceed_threshold() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(now);
        for i in 0..10 {
            let outcome = if i % 2 == 0 {
                CallOutcome::Failure
            } else {
                CallOutcome::Success
            };
            record = record.apply_outcome(&config(), outcome, false, now).unwrap();
        }
        // Exactly 50% does not exceed a 50% threshold.
        assert_eq!(record.state, BreakerState::Closed);

        let record = record
            .apply_outcome(&config(), CallOutcome::Failure, false, now)
            .unwrap();
        assert_eq!(record.state, BreakerState::Open);
    }

    #[test]
    fn expired_window_resets_counters() {
        let start = Utc::now();
        let mut record = CircuitBreakerRecord::closed(start);
        for _ in 0..9 {
            record = record
                .apply_outcome(&config(), CallOutcome::Failure, false, start)
                .unwrap();
        }

        let later = start + chrono::Duration::seconds(61);
        let record = record
            .apply_outcome(&config(), CallOutcome::Failure, false, later)
            .unwrap();
        assert_eq!(record.state, BreakerState::Closed);
        assert_eq!(record.error_count, 1);
        assert_eq!(record.window_start, later);
    }

    #[test]
    fn open_rejects_until_cool_down() {
        let now = Utc::now();
        let open = CircuitBreakerRecord::closed(now).transition(BreakerState::Open, now);

        let (admission, update) = open.decide(&config(), Priority::Normal, now);
        assert_eq!(admission, Admission::Reject(RejectReason::CircuitOpen));
        assert!(update.is_none());

        let later = now + chrono::Duration::milliseconds(60);
        let (admission, update) = open.decide(&config(), Priority::Normal, later);
        assert_eq!(
            admission,
            Admission::Admit {
                probe: true,
                overridden: false
            }
        );
        let half_open = update.unwrap();
        assert_eq!(half_open.state, BreakerState::HalfOpen);
        assert_eq!(half_open.probes_in_flight, 1);
    }

    #[test]
    fn critical_bypasses_open_without_write() {
        let now = Utc::now();
        let open = CircuitBreakerRecord::closed(now).transition(BreakerState::Open, now);
        let (admission, update) = open.decide(&config(), Priority::Critical, now);
        assert_eq!(
            admission,
            Admission::Admit {
                probe: false,
                overridden: true
            }
        );
        assert!(update.is_none());
    }

    #[test]
    fn half_open_limits_probes() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(now).transition(BreakerState::HalfOpen, now);
        for _ in 0..3 {
            let (admission, update) = record.decide(&config(), Priority::Normal, now);
            assert!(admission.is_admitted());
            record = update.unwrap();
        }
        let (admission, _) = record.decide(&config(), Priority::Normal, now);
        assert_eq!(admission, Admission::Reject(RejectReason::ProbeLimitReached));
        assert!(!admission.is_admitted());
    }

    #[test]
    fn half_open_closes_only_after_every_probe_succeeds() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(now).transition(BreakerState::HalfOpen, now);
        record.probes_in_flight = 2;

        let record = record
            .apply_outcome(&config(), CallOutcome::Success, true, now)
            .unwrap();
        assert_eq!(record.state, BreakerState::HalfOpen);

        let record = record
            .apply_outcome(&config(), CallOutcome::Success, true, now)
            .unwrap();
        assert_eq!(record.state, BreakerState::Closed);
        assert_eq!(record.error_count, 0);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_cool_down() {
        let opened = Utc::now();
        let probe_time = opened + chrono::Duration::seconds(5);
        let mut record = CircuitBreakerRecord::closed(opened).transition(BreakerState::HalfOpen, opened);
        record.probes_in_flight = 1;

        let record = record
            .apply_outcome(&config(), CallOutcome::Failure, true, probe_time)
            .unwrap();
        assert_eq!(record.state, BreakerState::Open);
        assert_eq!(record.last_transition_at, probe_time);
    }

    #[test]
    fn half_open_ignores_calls_that_held_no_slot() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(now).transition(BreakerState::HalfOpen, now);
        record.probes_in_flight = 1;

        assert!(record.apply_outcome(&config(), CallOutcome::Success, false, now).is_none());
        assert!(record.apply_outcome(&config(), CallOutcome::Failure, false, now).is_none());
    }

    #[test]
    fn release_slot_only_frees_taken_half_open_slots() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(now).transition(BreakerState::HalfOpen, now);
        record.probes_in_flight = 2;

        let released = record.release_slot().unwrap();
        assert_eq!(released.state, BreakerState::HalfOpen);
        assert_eq!(released.probes_in_flight, 1);

        record.probes_in_flight = 0;
        assert!(record.release_slot().is_none());
        assert!(CircuitBreakerRecord::closed(now).release_slot().is_none());
    }

    #[test]
    fn open_ignores_late_reports() {
        let now = Utc::now();
        let open = CircuitBreakerRecord::closed(now).transition(BreakerState::Open, now);
        assert!(open.apply_outcome(&config(), CallOutcome::Success, false, now).is_none());
    }

    // -- manager against a shared store --

    #[tokio::test]
    async fn failing_destination_opens_within_one_report_cycle() {
        let (breakers, sink) = manager(InMemoryStore::new());

        fail_n(&breakers, 9).await;
        assert_eq!(
            breakers.record(&svc("orch"), &svc("x")).await.unwrap().state,
            BreakerState::Closed
        );

        fail_n(&breakers, 1).await;
        assert_eq!(
            breakers.record(&svc("orch"), &svc("x")).await.unwrap().state,
            BreakerState::Open
        );

        let admission = breakers
            .admit(&svc("orch"), &svc("x"), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(admission, Admission::Reject(RejectReason::CircuitOpen));
        assert_eq!(sink.events_of_kind("breaker_transition").len(), 1);
    }

    #[tokio::test]
    async fn recovers_after_cool_down_and_one_successful_probe() {
        let (breakers, _) = manager(InMemoryStore::new());
        fail_n(&breakers, 10).await;

        tokio::time::sleep(Duration::from_millis(60)).await;

        let admission = breakers
            .admit(&svc("orch"), &svc("x"), Priority::Normal)
            .await
            .unwrap();
        assert!(admission.is_admitted());
        assert_eq!(
            breakers.record(&svc("orch"), &svc("x")).await.unwrap().state,
            BreakerState::HalfOpen
        );

        breakers
            .report(&svc("orch"), &svc("x"), Some(admission), CallOutcome::Success)
            .await
            .unwrap();
        let record = breakers.record(&svc("orch"), &svc("x")).await.unwrap();
        assert_eq!(record.state, BreakerState::Closed);
        assert_eq!(record.error_count, 0);
    }

    #[tokio::test]
    async fn unadmitted_success_does_not_close_a_half_open_breaker() {
        let (breakers, _) = manager(InMemoryStore::new());
        fail_n(&breakers, 10).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let admission = breakers
            .admit(&svc("orch"), &svc("x"), Priority::Normal)
            .await
            .unwrap();
        assert!(admission.is_trial());

        // A compensation succeeds while the admitted call is still out.
        breakers
            .report(&svc("orch"), &svc("x"), None, CallOutcome::Success)
            .await
            .unwrap();
        let record = breakers.record(&svc("orch"), &svc("x")).await.unwrap();
        assert_eq!(record.state, BreakerState::HalfOpen);
        assert_eq!(record.probes_in_flight, 1);

        breakers
            .report(&svc("orch"), &svc("x"), Some(admission), CallOutcome::Failure)
            .await
            .unwrap();
        assert_eq!(
            breakers.record(&svc("orch"), &svc("x")).await.unwrap().state,
            BreakerState::Open
        );
    }

    #[tokio::test]
    async fn overridden_call_does_not_count_toward_recovery() {
        let (breakers, _) = manager(InMemoryStore::new());
        fail_n(&breakers, 10).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let mut admissions = Vec::new();
        for _ in 0..3 {
            admissions.push(
                breakers
                    .admit(&svc("orch"), &svc("x"), Priority::Normal)
                    .await
                    .unwrap(),
            );
        }
        let forced = breakers
            .admit(&svc("orch"), &svc("x"), Priority::Critical)
            .await
            .unwrap();
        assert!(!forced.is_trial());

        breakers
            .report(&svc("orch"), &svc("x"), Some(forced), CallOutcome::Success)
            .await
            .unwrap();
        let record = breakers.record(&svc("orch"), &svc("x")).await.unwrap();
        assert_eq!(record.state, BreakerState::HalfOpen);
        assert_eq!(record.probes_in_flight, 3);

        for admission in admissions {
            breakers
                .report(&svc("orch"), &svc("x"), Some(admission), CallOutcome::Success)
                .await
                .unwrap();
        }
        assert_eq!(
            breakers.record(&svc("orch"), &svc("x")).await.unwrap().state,
            BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn released_slot_can_be_admitted_again() {
        let (breakers, _) = manager(InMemoryStore::new());
        fail_n(&breakers, 10).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        for _ in 0..3 {
            let admission = breakers
                .admit(&svc("orch"), &svc("x"), Priority::Normal)
                .await
                .unwrap();
            breakers
                .release(&svc("orch"), &svc("x"), admission)
                .await
                .unwrap();
        }

        let record = breakers.record(&svc("orch"), &svc("x")).await.unwrap();
        assert_eq!(record.state, BreakerState::HalfOpen);
        assert_eq!(record.probes_in_flight, 0);
        assert!(
            breakers
                .admit(&svc("orch"), &svc("x"), Priority::Normal)
                .await
                .unwrap()
                .is_trial()
        );
    }

    #[tokio::test]
    async fn replicas_sharing_a_store_converge() {
        let store = InMemoryStore::new();
        let (replica_a, _) = manager(store.clone());
        let (replica_b, _) = manager(store);

        fail_n(&replica_a, 5).await;
        fail_n(&replica_b, 5).await;

        let admission = replica_a
            .admit(&svc("orch"), &svc("x"), Priority::Normal)
            .await
            .unwrap();
        assert!(!admission.is_admitted());
        assert_eq!(
            replica_b.record(&svc("orch"), &svc("x")).await.unwrap().state,
            BreakerState::Open
        );
    }

    #[tokio::test]
    async fn concurrent_reports_are_not_lost_under_contention_budget() {
        let store = InMemoryStore::new();
        let breakers = Arc::new(CircuitBreakerManager::new(
            store,
            ResilienceConfig {
                report_max_retries: 50,
                breaker_min_samples: 1_000,
                ..config()
            },
            Arc::new(InMemorySink::new()),
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let breakers = breakers.clone();
            handles.push(tokio::spawn(async move {
                breakers
                    .report(&svc("orch"), &svc("x"), None, CallOutcome::Success)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = breakers.record(&svc("orch"), &svc("x")).await.unwrap();
        assert_eq!(record.success_count, 10);
        // One accepted write per report, each bumping the version by one.
        assert_eq!(record.version, Version::new(10));
    }

    #[tokio::test]
    async fn critical_override_is_audited() {
        let (breakers, sink) = manager(InMemoryStore::new());
        fail_n(&breakers, 10).await;

        let admission = breakers
            .admit(&svc("orch"), &svc("x"), Priority::Critical)
            .await
            .unwrap();
        assert_eq!(
            admission,
            Admission::Admit {
                probe: false,
                overridden: true
            }
        );
        assert_eq!(sink.events_of_kind("critical_override").len(), 1);
        // The override does not move the breaker.
        assert_eq!(
            breakers.record(&svc("orch"), &svc("x")).await.unwrap().state,
            BreakerState::Open
        );
    }

    #[tokio::test]
    async fn pairs_are_independent() {
        let (breakers, _) = manager(InMemoryStore::new());
        fail_n(&breakers, 10).await;

        let other = breakers
            .admit(&svc("orch"), &svc("y"), Priority::Normal)
            .await
            .unwrap();
        assert!(other.is_admitted());
    }

    #[tokio::test]
    async fn reset_closes_an_open_breaker() {
        let (breakers, _) = manager(InMemoryStore::new());
        fail_n(&breakers, 10).await;

        breakers.reset(&svc("orch"), &svc("x")).await.unwrap();
        assert!(
            breakers
                .admit(&svc("orch"), &svc("x"), Priority::Normal)
                .await
                .unwrap()
                .is_admitted()
        );
    }

    #[tokio::test]
    async fn report_is_dropped_after_retry_budget() {
        let sink = InMemorySink::new();
        let store = Arc::new(RejectingStore::default());
        let breakers = CircuitBreakerManager::new(
            store.clone(),
            ResilienceConfig {
                report_max_retries: 3,
                ..config()
            },
            Arc::new(sink.clone()),
        );

        breakers
            .report(&svc("orch"), &svc("x"), None, CallOutcome::Failure)
            .await
            .unwrap();
        assert_eq!(sink.events_of_kind("report_dropped").len(), 1);
        // The first write plus three retries.
        assert_eq!(store.writes(), 4);
    }

    #[tokio::test]
    async fn zero_retries_still_attempts_one_write() {
        let store = Arc::new(RejectingStore::default());
        let breakers = CircuitBreakerManager::new(
            store.clone(),
            ResilienceConfig {
                report_max_retries: 0,
                ..config()
            },
            Arc::new(InMemorySink::new()),
        );

        breakers
            .report(&svc("orch"), &svc("x"), None, CallOutcome::Success)
            .await
            .unwrap();
        assert_eq!(store.writes(), 1);
    }

    /// Test store whose conditional writes always lose the race.
    mod rejecting {
        use std::sync::atomic::{AtomicUsize, Ordering};

        use async_trait::async_trait;
        use state_store::{Result, Version, Versioned, VersionedStore};

        #[derive(Default)]
        pub struct RejectingStore {
            writes: AtomicUsize,
        }

        impl RejectingStore {
            pub fn writes(&self) -> usize {
                self.writes.load(Ordering::SeqCst)
            }
        }

        #[async_trait]
        impl VersionedStore for RejectingStore {
            async fn get(&self, _key: &str) -> Result<Option<Versioned>> {
                Ok(None)
            }

            async fn put_if_version(
                &self,
                _key: &str,
                _value: serde_json::Value,
                _expected: Version,
            ) -> Result<bool> {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }

            async fn list_keys(&self, _prefix: &str) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
        }
    }
}
