//! Correlation and deadline propagation along a call chain.
//!
//! Deadlines are absolute instants, not remaining durations, so time spent
//! queueing or retrying upstream is charged against every downstream hop.
//! A child context can only narrow its parent's deadline.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use common::{SpanId, TraceId};
use serde::{Deserialize, Serialize};

use crate::error::DeadlineError;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const SPAN_ID_HEADER: &str = "x-span-id";
pub const PARENT_SPAN_ID_HEADER: &str = "x-parent-span-id";
pub const DEADLINE_HEADER: &str = "x-deadline-ms";
pub const BAGGAGE_HEADER: &str = "baggage";

/// Metadata carried with every cross-service call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub baggage: BTreeMap<String, String>,
}

/// `now + timeout`, saturating at the latest representable instant.
fn deadline_after(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl CorrelationContext {
    /// Starts a new trace that must finish within `timeout`.
    pub fn root(timeout: Duration) -> Self {
        Self::with_deadline(TraceId::new(), deadline_after(Utc::now(), timeout))
    }

    /// Starts a new span of an existing trace with a fixed deadline.
    pub fn with_deadline(trace_id: TraceId, deadline: DateTime<Utc>) -> Self {
        Self {
            trace_id,
            span_id: SpanId::new(),
            parent_span_id: None,
            deadline,
            baggage: BTreeMap::new(),
        }
    }

    /// Adds a baggage entry. Existing entries are kept.
    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    /// Time left before the deadline, floored at zero.
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self) -> bool {
        self.deadline <= Utc::now()
    }

    /// Encodes the context as outgoing request headers.
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (TRACE_ID_HEADER, self.trace_id.to_string()),
            (SPAN_ID_HEADER, self.span_id.to_string()),
            (DEADLINE_HEADER, self.deadline.timestamp_millis().to_string()),
        ];
        if let Some(parent) = &self.parent_span_id {
            headers.push((PARENT_SPAN_ID_HEADER, parent.to_string()));
        }
        if !self.baggage.is_empty() {
            let encoded = self
                .baggage
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            headers.push((BAGGAGE_HEADER, encoded));
        }
        headers
    }

    /// Decodes a context from incoming request headers.
    ///
    /// Header names are matched case-insensitively. The trace id and deadline
    /// are required.
    pub fn from_headers<'a, I>(headers: I) -> Result<Self, DeadlineError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut trace_id = None;
        let mut span_id = None;
        let mut parent_span_id = None;
        let mut deadline = None;
        let mut baggage = BTreeMap::new();

        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            let value = value.trim();
            match name.as_str() {
                TRACE_ID_HEADER => trace_id = Some(parse_id::<TraceId>(TRACE_ID_HEADER, value)?),
                SPAN_ID_HEADER => span_id = Some(parse_id::<SpanId>(SPAN_ID_HEADER, value)?),
                PARENT_SPAN_ID_HEADER => {
                    parent_span_id = Some(parse_id::<SpanId>(PARENT_SPAN_ID_HEADER, value)?)
                }
                DEADLINE_HEADER => deadline = Some(parse_deadline(value)?),
                BAGGAGE_HEADER => {
                    for entry in value.split(',').filter(|e| !e.trim().is_empty()) {
                        let (k, v) = entry.split_once('=').ok_or_else(|| {
                            DeadlineError::InvalidHeader {
                                header: BAGGAGE_HEADER.to_string(),
                                reason: format!("entry '{entry}' is not key=value"),
                            }
                        })?;
                        baggage.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
                _ => {}
            }
        }

        let missing = |header: &str| DeadlineError::InvalidHeader {
            header: header.to_string(),
            reason: "missing".to_string(),
        };

        Ok(Self {
            trace_id: trace_id.ok_or_else(|| missing(TRACE_ID_HEADER))?,
            span_id: span_id.unwrap_or_default(),
            parent_span_id,
            deadline: deadline.ok_or_else(|| missing(DEADLINE_HEADER))?,
            baggage,
        })
    }
}

fn parse_id<T: std::str::FromStr<Err = uuid::Error>>(
    header: &str,
    value: &str,
) -> Result<T, DeadlineError> {
    value.parse().map_err(|e: uuid::Error| DeadlineError::InvalidHeader {
        header: header.to_string(),
        reason: e.to_string(),
    })
}

fn parse_deadline(value: &str) -> Result<DateTime<Utc>, DeadlineError> {
    let invalid = |reason: String| DeadlineError::InvalidHeader {
        header: DEADLINE_HEADER.to_string(),
        reason,
    };
    let millis: i64 = value.parse().map_err(|e| invalid(format!("{e}")))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| invalid(format!("{millis} is out of range")))
}

/// Derives the context for a downstream call.
///
/// The child keeps the trace id, gets a fresh span id and inherits the parent's
/// baggage. Its deadline is the earlier of the parent's deadline and
/// `now + step_timeout`. Fails without creating a child if that leaves no time.
pub fn derive(
    parent: &CorrelationContext,
    step_timeout: Duration,
) -> Result<CorrelationContext, DeadlineError> {
    let now = Utc::now();
    let deadline = parent.deadline.min(deadline_after(now, step_timeout));

    if deadline <= now {
        let overdue_ms = (now - deadline).num_milliseconds();
        metrics::counter!("deadline_already_exceeded_total").increment(1);
        tracing::debug!(trace_id = %parent.trace_id, overdue_ms, "deadline already exceeded");
        return Err(DeadlineError::AlreadyExceeded { overdue_ms });
    }

    Ok(CorrelationContext {
        trace_id: parent.trace_id,
        span_id: SpanId::new(),
        parent_span_id: Some(parent.span_id),
        deadline,
        baggage: parent.baggage.clone(),
    })
}

/// Time left before the context's deadline, floored at zero.
pub fn remaining(ctx: &CorrelationContext) -> Duration {
    ctx.remaining()
}

/// Runs `fut` until it finishes or the context's deadline passes.
///
/// The future is not polled at all if the deadline has already passed.
/// On expiry the future is dropped, which cancels it.
pub async fn within<F>(ctx: &CorrelationContext, fut: F) -> Result<F::Output, DeadlineError>
where
    F: Future,
{
    let budget = ctx.remaining();
    if budget.is_zero() {
        let overdue_ms = (Utc::now() - ctx.deadline).num_milliseconds();
        return Err(DeadlineError::AlreadyExceeded { overdue_ms });
    }

    match tokio::time::timeout(budget, fut).await {
        Ok(output) => Ok(output),
        Err(_) => {
            metrics::counter!("deadline_exceeded_total").increment(1);
            tracing::warn!(trace_id = %ctx.trace_id, span_id = %ctx.span_id, ?budget, "call exceeded its deadline");
            Err(DeadlineError::Exceeded { budget })
        }
    }
}
