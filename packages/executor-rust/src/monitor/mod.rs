//! Operation metrics, health and the audit trail.
//!
//! # Metrics
//! Besides its own in-memory tables, the monitor feeds the `metrics` facade:
//! - `modguard_operations_total` (counter): completed operations by `kind`, `outcome`
//! - `modguard_operation_duration_seconds` (histogram): latency by `kind`
//! - `modguard_lock_contention_total` (counter): callers that had to queue
//! - `modguard_breaker_trips_total` (counter): breaker trips by `kind`
//!
//! Nothing is exported unless the embedding process installs a recorder.
//!
//! The monitor never schedules its own cleanup; the caller runs
//! [`ModerationMonitor::clear_old_data`], usually through the maintenance
//! worker.

mod audit;
mod metrics;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use modguard_core::{ClockSource, ModerationAuditEvent, OperationKind, Severity, SubjectId, SystemClock};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use self::audit::AuditLog;
use self::metrics::OperationMetrics;
pub use self::metrics::{HealthStatus, MetricsReport, OperationSnapshot, SystemHealth};
use crate::config::MonitorConfig;

const MS_PER_HOUR: u64 = 3_600_000;

/// Token returned by [`ModerationMonitor::start_operation`].
#[derive(Debug)]
#[must_use = "pass to end_operation"]
pub struct OperationStart {
    kind: OperationKind,
    started: Instant,
}

impl OperationStart {
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Collects per-kind statistics, contention and trip counts, and the audit
/// trail. Shared as `Arc<ModerationMonitor>`.
pub struct ModerationMonitor {
    config: MonitorConfig,
    clock: Arc<dyn ClockSource>,
    operations: Mutex<HashMap<OperationKind, OperationMetrics>>,
    audit: Mutex<AuditLog>,
    breaker_trips: Mutex<HashMap<OperationKind, u64>>,
    lock_contention: AtomicU64,
    in_flight: AtomicU64,
}

impl Default for ModerationMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl ModerationMonitor {
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Timestamp audit events and errors with `clock` instead of wall time.
    #[must_use]
    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn ClockSource>) -> Self {
        let audit = AuditLog::new(config.audit_capacity);
        Self {
            config,
            clock,
            operations: Mutex::new(HashMap::new()),
            audit: Mutex::new(audit),
            breaker_trips: Mutex::new(HashMap::new()),
            lock_contention: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }
    }

    /// Milliseconds since the Unix epoch, per the monitor's clock.
    #[must_use]
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn start_operation(&self, kind: OperationKind) -> OperationStart {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        OperationStart {
            kind,
            started: Instant::now(),
        }
    }

    /// Close an operation opened by [`start_operation`](Self::start_operation).
    /// Returns the measured latency.
    ///
    /// Failures are bucketed by the leading token of `error`.
    pub fn end_operation(
        &self,
        start: OperationStart,
        success: bool,
        error: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Duration {
        let latency = start.started.elapsed();
        let kind = start.kind;
        // Saturating: never wraps if end is called without a matching start.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));

        {
            let mut operations = self.operations.lock();
            let entry = operations
                .entry(kind)
                .or_insert_with(|| OperationMetrics::new(self.config.latency_window));
            if success {
                entry.record_success(latency);
            } else {
                entry.record_failure(latency, error.unwrap_or("unknown"), self.clock.now_millis());
            }
        }

        let outcome = if success { "success" } else { "failure" };
        ::metrics::counter!("modguard_operations_total", "kind" => kind.as_str(), "outcome" => outcome)
            .increment(1);
        ::metrics::histogram!("modguard_operation_duration_seconds", "kind" => kind.as_str())
            .record(latency.as_secs_f64());

        debug!(
            %kind,
            outcome,
            latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            error,
            metadata = metadata.map(tracing::field::display),
            "operation finished"
        );
        latency
    }

    /// Append to the audit trail. High-severity actions are logged at `warn`.
    pub fn record_audit_event(&self, event: ModerationAuditEvent) {
        if event.severity() == Severity::High {
            warn!(
                target: "modguard::audit",
                id = %event.id,
                kind = %event.kind,
                subject = %event.subject,
                actor = %event.actor,
                outcome = ?event.outcome,
                latency_ms = event.latency_ms,
                error = event.error.as_deref(),
                reason = event.reason.as_deref(),
                "high-severity moderation action"
            );
        } else {
            info!(
                target: "modguard::audit",
                id = %event.id,
                kind = %event.kind,
                subject = %event.subject,
                actor = %event.actor,
                outcome = ?event.outcome,
                latency_ms = event.latency_ms,
                error = event.error.as_deref(),
                "moderation action"
            );
        }
        self.audit.lock().push(event);
    }

    pub fn record_lock_contention(&self) {
        self.lock_contention.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("modguard_lock_contention_total").increment(1);
    }

    pub fn record_circuit_breaker_trip(&self, kind: OperationKind) {
        *self.breaker_trips.lock().entry(kind).or_insert(0) += 1;
        ::metrics::counter!("modguard_breaker_trips_total", "kind" => kind.as_str()).increment(1);
    }

    #[must_use]
    pub fn get_operation_metrics(&self, kind: OperationKind) -> Option<OperationSnapshot> {
        self.operations.lock().get(&kind).map(|m| m.snapshot(kind))
    }

    #[must_use]
    pub fn get_all_metrics(&self) -> MetricsReport {
        let operations: BTreeMap<_, _> = self
            .operations
            .lock()
            .iter()
            .map(|(kind, m)| (*kind, m.snapshot(*kind)))
            .collect();
        let breaker_trips: BTreeMap<_, _> = self
            .breaker_trips
            .lock()
            .iter()
            .map(|(kind, n)| (*kind, *n))
            .collect();

        MetricsReport {
            generated_at_ms: self.clock.now_millis(),
            operations,
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            breaker_trips,
            audit_events: self.audit.lock().len(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Aggregate health.
    ///
    /// `Unhealthy` below `unhealthy_success_rate`, `Degraded` below
    /// `degraded_success_rate` or when any breaker has tripped since the last
    /// cleanup, `Healthy` otherwise.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_system_health(&self) -> SystemHealth {
        let (total, failed, latency_sum, samples) = self.operations.lock().values().fold(
            (0_u64, 0_u64, Duration::ZERO, 0_usize),
            |(total, failed, sum, samples), m| {
                let (t, f) = m.totals();
                let (s, n) = m.window();
                (total + t, failed + f, sum.saturating_add(s), samples + n)
            },
        );
        let breaker_trips: u64 = self.breaker_trips.lock().values().sum();

        let success_rate = if total == 0 {
            1.0
        } else {
            (total - failed) as f64 / total as f64
        };
        let average_latency_ms = if samples == 0 {
            0.0
        } else {
            latency_sum.as_secs_f64() * 1000.0 / samples as f64
        };

        let status = if success_rate < self.config.unhealthy_success_rate {
            HealthStatus::Unhealthy
        } else if success_rate < self.config.degraded_success_rate || breaker_trips > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SystemHealth {
            status,
            success_rate,
            total_operations: total,
            failed_operations: failed,
            average_latency_ms,
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            breaker_trips,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            audit_events: self.audit.lock().len(),
        }
    }

    /// Up to `limit` audit events, newest first.
    #[must_use]
    pub fn recent_audit_events(&self, limit: usize) -> Vec<ModerationAuditEvent> {
        self.audit.lock().recent(limit)
    }

    /// Buffered audit events for `subject`, oldest first.
    #[must_use]
    pub fn audit_events_for_subject(&self, subject: SubjectId) -> Vec<ModerationAuditEvent> {
        self.audit.lock().for_subject(subject)
    }

    /// Prune audit events older than `max_age_hours` and reset the contention
    /// and trip counters. Per-kind totals are kept. Returns the number of
    /// audit events pruned.
    pub fn clear_old_data(&self, max_age_hours: u64) -> usize {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(max_age_hours.saturating_mul(MS_PER_HOUR));
        let pruned = self.audit.lock().prune_before(cutoff);
        self.lock_contention.store(0, Ordering::Relaxed);
        self.breaker_trips.lock().clear();
        info!(pruned, max_age_hours, "cleared old monitor data");
        pruned
    }
}
