//! Startup configuration for the execution layer.
//!
//! Per-kind retry, breaker and timeout policies live in
//! [`PolicyRegistry`](crate::resilience::PolicyRegistry); this module holds
//! the process-wide knobs.

use std::time::Duration;

/// Top-level configuration for a [`ModerationExecutor`](crate::ModerationExecutor).
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Per-subject serialization settings.
    pub lock: LockConfig,
    /// Metrics and audit buffer settings.
    pub monitor: MonitorConfig,
    /// Periodic maintenance settings.
    pub maintenance: MaintenanceConfig,
}

/// Per-subject lock and queue settings.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Maximum callers waiting behind the current holder of one subject.
    pub queue_capacity: usize,
    /// How long a queued caller waits for its turn before giving up.
    pub queue_timeout: Duration,
    /// Lock-table size above which idle locks are compacted on acquire.
    pub cleanup_threshold: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            queue_timeout: Duration::from_secs(30),
            cleanup_threshold: 100,
        }
    }
}

/// Monitor buffer sizes and health thresholds.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Audit ring-buffer capacity; the oldest event is evicted beyond it.
    pub audit_capacity: usize,
    /// Number of latency samples kept per operation kind.
    pub latency_window: usize,
    /// Success rate below which the system reports `Degraded`.
    pub degraded_success_rate: f64,
    /// Success rate below which the system reports `Unhealthy`.
    pub unhealthy_success_rate: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            audit_capacity: 1000,
            latency_window: 100,
            degraded_success_rate: 0.95,
            unhealthy_success_rate: 0.80,
        }
    }
}

/// Settings for the caller-owned maintenance worker.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between maintenance ticks in milliseconds.
    pub interval_ms: u64,
    /// Audit events older than this are pruned on each tick.
    pub audit_max_age_hours: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_600_000,
            audit_max_age_hours: 24,
        }
    }
}
