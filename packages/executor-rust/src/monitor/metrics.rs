//! Per-kind operation statistics and the reports built from them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use modguard_core::OperationKind;
use serde::Serialize;

/// Overall verdict of [`SystemHealth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Aggregate health across every operation kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    /// Successes over completed operations; `1.0` when nothing has run.
    pub success_rate: f64,
    pub total_operations: u64,
    pub failed_operations: u64,
    /// Mean of every kind's latency window, weighted by sample count.
    pub average_latency_ms: f64,
    pub lock_contention: u64,
    pub breaker_trips: u64,
    pub in_flight: u64,
    pub audit_events: usize,
}

/// Read-only view of one kind's statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSnapshot {
    pub kind: OperationKind,
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    /// Moving average over the latency window.
    pub average_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Failure counts keyed by the error's leading token.
    pub error_types: BTreeMap<String, u64>,
    pub last_error: Option<String>,
    pub last_error_at_ms: Option<u64>,
}

/// Everything the monitor tracks, at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub generated_at_ms: u64,
    pub operations: BTreeMap<OperationKind, OperationSnapshot>,
    pub lock_contention: u64,
    pub breaker_trips: BTreeMap<OperationKind, u64>,
    pub audit_events: usize,
    pub in_flight: u64,
}

/// Leading token of an error string: everything before the first `:` or
/// whitespace. [`ExecutionError::tagged_message`](crate::ExecutionError::tagged_message)
/// puts a stable tag there.
pub(crate) fn error_type(error: &str) -> &str {
    let token = error
        .trim_start()
        .split(|c: char| c == ':' || c.is_whitespace())
        .next()
        .unwrap_or_default();
    if token.is_empty() {
        "unknown"
    } else {
        token
    }
}

fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn as_millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Mutable counters for one kind.
#[derive(Debug)]
pub(crate) struct OperationMetrics {
    total: u64,
    successes: u64,
    failures: u64,
    window: usize,
    latencies: VecDeque<Duration>,
    window_sum: Duration,
    min_latency: Option<Duration>,
    max_latency: Option<Duration>,
    error_types: HashMap<String, u64>,
    last_error: Option<String>,
    last_error_at_ms: Option<u64>,
}

impl OperationMetrics {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            total: 0,
            successes: 0,
            failures: 0,
            window: window.max(1),
            latencies: VecDeque::with_capacity(window.max(1)),
            window_sum: Duration::ZERO,
            min_latency: None,
            max_latency: None,
            error_types: HashMap::new(),
            last_error: None,
            last_error_at_ms: None,
        }
    }

    pub(crate) fn record_success(&mut self, latency: Duration) {
        self.total += 1;
        self.successes += 1;
        self.push_latency(latency);
    }

    pub(crate) fn record_failure(&mut self, latency: Duration, error: &str, at_ms: u64) {
        self.total += 1;
        self.failures += 1;
        self.push_latency(latency);
        *self.error_types.entry(error_type(error).to_owned()).or_insert(0) += 1;
        self.last_error = Some(error.to_owned());
        self.last_error_at_ms = Some(at_ms);
    }

    fn push_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.window {
            if let Some(oldest) = self.latencies.pop_front() {
                self.window_sum = self.window_sum.saturating_sub(oldest);
            }
        }
        self.latencies.push_back(latency);
        self.window_sum = self.window_sum.saturating_add(latency);
        self.min_latency = Some(self.min_latency.map_or(latency, |min| min.min(latency)));
        self.max_latency = Some(self.max_latency.map_or(latency, |max| max.max(latency)));
    }

    pub(crate) fn totals(&self) -> (u64, u64) {
        (self.total, self.failures)
    }

    /// Sum and count of the current latency window.
    pub(crate) fn window(&self) -> (Duration, usize) {
        (self.window_sum, self.latencies.len())
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn snapshot(&self, kind: OperationKind) -> OperationSnapshot {
        let success_rate = if self.total == 0 {
            1.0
        } else {
            self.successes as f64 / self.total as f64
        };
        let average_latency_ms = if self.latencies.is_empty() {
            0.0
        } else {
            as_millis_f64(self.window_sum) / self.latencies.len() as f64
        };

        OperationSnapshot {
            kind,
            total: self.total,
            successes: self.successes,
            failures: self.failures,
            success_rate,
            average_latency_ms,
            min_latency_ms: self.min_latency.map_or(0, as_millis_u64),
            max_latency_ms: self.max_latency.map_or(0, as_millis_u64),
            error_types: self.error_types.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            last_error: self.last_error.clone(),
            last_error_at_ms: self.last_error_at_ms,
        }
    }
}
