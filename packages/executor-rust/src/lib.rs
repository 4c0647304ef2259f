//! `modguard` executor: serialized, circuit-broken, retried and monitored
//! execution of moderation actions against an unreliable remote service.

pub mod config;
pub mod error;
pub mod monitor;
pub mod resilience;
pub mod serialization;
pub mod service;
pub mod traits;

pub use config::{ExecutorConfig, LockConfig, MaintenanceConfig, MonitorConfig};
pub use error::{ErrorCategory, ExecutionError};
pub use monitor::{HealthStatus, MetricsReport, ModerationMonitor, OperationSnapshot, OperationStart, SystemHealth};
pub use resilience::{
    BreakerConfig, BreakerError, BreakerStats, CircuitBreaker, CircuitState, PolicyRegistry, RetryConfig,
    RetryHandler, TimeoutConfig, TimeoutHandler, TimeoutTier,
};
pub use serialization::{LockError, LockManager, LockStats};
pub use service::{ActionOutcome, ModerationAction, ModerationExecutor};
pub use traits::{CaseDraft, CaseRecorder, Notice, Notifier};
