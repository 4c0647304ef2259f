//! Per-kind retry, circuit-breaker and timeout policies.
//!
//! Every [`OperationKind`] has built-in defaults: destructive kinds get tight
//! breakers and few attempts, bulk and low-risk kinds get tolerant ones. The
//! [`PolicyRegistry`] is assembled once at startup with any overrides and is
//! read-only afterwards.

use std::collections::HashMap;
use std::time::Duration;

use modguard_core::{OperationKind, UnknownOperationKind};

use super::timeout::TimeoutTier;

/// Rejected policy values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("{kind}: max_attempts must be at least 1")]
    NoAttempts { kind: OperationKind },
    #[error("{kind}: backoff_factor must be >= 1.0, got {factor}")]
    ShrinkingBackoff { kind: OperationKind, factor: f64 },
    #[error("{kind}: failure_threshold must be at least 1")]
    ZeroThreshold { kind: OperationKind },
    #[error("{kind}: extend_factor must be > 1.0, got {factor}")]
    NonExtendingTimeout { kind: OperationKind, factor: f64 },
    #[error("{kind}: {tier} timeout must be non-zero")]
    ZeroTimeout { kind: OperationKind, tier: TimeoutTier },
}

/// Circuit-breaker thresholds for one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive counted failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a probe.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Retry behaviour for one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total invocations, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Spread each delay by up to ±25 %.
    pub jitter: bool,
    /// Longest rate-limit hint honoured as-is; longer hints are capped.
    pub rate_limit_cap: Duration,
    pub breaker: BreakerConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            rate_limit_cap: Duration::from_secs(60),
            breaker: BreakerConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Built-in policy for `kind`.
    #[must_use]
    pub fn for_kind(kind: OperationKind) -> Self {
        let base = Self::default();
        match kind {
            OperationKind::Ban | OperationKind::Softban | OperationKind::Kick => Self {
                max_attempts: 2,
                max_delay: Duration::from_secs(5),
                breaker: BreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout: Duration::from_secs(60),
                },
                ..base
            },
            OperationKind::Timeout
            | OperationKind::RemoveTimeout
            | OperationKind::Unban
            | OperationKind::RoleUpdate => Self {
                max_delay: Duration::from_secs(10),
                breaker: BreakerConfig {
                    failure_threshold: 5,
                    recovery_timeout: Duration::from_secs(30),
                },
                ..base
            },
            OperationKind::Purge => Self {
                max_attempts: 5,
                base_delay: Duration::from_millis(500),
                breaker: BreakerConfig {
                    failure_threshold: 10,
                    recovery_timeout: Duration::from_secs(30),
                },
                ..base
            },
            OperationKind::Notification => Self {
                max_attempts: 2,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(2),
                rate_limit_cap: Duration::from_secs(5),
                breaker: BreakerConfig {
                    failure_threshold: 10,
                    recovery_timeout: Duration::from_secs(15),
                },
                ..base
            },
            OperationKind::CaseRecord => Self {
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
                breaker: BreakerConfig {
                    failure_threshold: 5,
                    recovery_timeout: Duration::from_secs(30),
                },
                ..base
            },
            OperationKind::Warn | OperationKind::Note | OperationKind::ExternalApi => base,
        }
    }

    /// # Errors
    ///
    /// Returns the first out-of-range field.
    pub fn validate(&self, kind: OperationKind) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::NoAttempts { kind });
        }
        if self.backoff_factor < 1.0 {
            return Err(PolicyError::ShrinkingBackoff {
                kind,
                factor: self.backoff_factor,
            });
        }
        if self.breaker.failure_threshold == 0 {
            return Err(PolicyError::ZeroThreshold { kind });
        }
        Ok(())
    }
}

/// Timeout budgets for one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutConfig {
    /// Budget for the primary remote action.
    pub operation_timeout: Duration,
    /// Budget for best-effort notifications.
    pub notification_timeout: Duration,
    /// Budget for case-record writes.
    pub persistence_timeout: Duration,
    /// Budget for auxiliary remote API calls.
    pub external_api_timeout: Duration,
    /// Extra attempts granted after the first timeout when degrading gracefully.
    pub max_extend_attempts: u32,
    /// Growth of the budget per extension.
    pub extend_factor: f64,
    pub graceful_degradation: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(15),
            notification_timeout: Duration::from_secs(5),
            persistence_timeout: Duration::from_secs(10),
            external_api_timeout: Duration::from_secs(20),
            max_extend_attempts: 2,
            extend_factor: 1.5,
            graceful_degradation: true,
        }
    }
}

impl TimeoutConfig {
    /// Built-in budgets for `kind`.
    #[must_use]
    pub fn for_kind(kind: OperationKind) -> Self {
        let base = Self::default();
        match kind {
            OperationKind::Purge => Self {
                operation_timeout: Duration::from_secs(60),
                ..base
            },
            OperationKind::Notification => Self {
                operation_timeout: Duration::from_secs(5),
                graceful_degradation: false,
                ..base
            },
            OperationKind::CaseRecord => Self {
                operation_timeout: Duration::from_secs(10),
                graceful_degradation: false,
                ..base
            },
            OperationKind::Ban | OperationKind::Softban | OperationKind::Kick => Self {
                max_extend_attempts: 1,
                ..base
            },
            OperationKind::Unban
            | OperationKind::Timeout
            | OperationKind::RemoveTimeout
            | OperationKind::Warn
            | OperationKind::Note
            | OperationKind::RoleUpdate
            | OperationKind::ExternalApi => base,
        }
    }

    /// Base budget for a tier.
    #[must_use]
    pub fn budget(&self, tier: TimeoutTier) -> Duration {
        match tier {
            TimeoutTier::Operation => self.operation_timeout,
            TimeoutTier::Notification => self.notification_timeout,
            TimeoutTier::Persistence => self.persistence_timeout,
            TimeoutTier::ExternalApi => self.external_api_timeout,
        }
    }

    /// Budget for the `attempt`-th extension (0-based):
    /// `operation_timeout * extend_factor^(attempt + 1)`.
    #[must_use]
    pub fn extended_timeout(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_add(1)).unwrap_or(i32::MAX);
        self.operation_timeout
            .mul_f64(self.extend_factor.powi(exponent).min(1e6))
    }

    /// # Errors
    ///
    /// Returns the first out-of-range field.
    pub fn validate(&self, kind: OperationKind) -> Result<(), PolicyError> {
        for tier in TimeoutTier::ALL {
            if self.budget(tier).is_zero() {
                return Err(PolicyError::ZeroTimeout { kind, tier });
            }
        }
        if self.graceful_degradation && self.extend_factor <= 1.0 {
            return Err(PolicyError::NonExtendingTimeout {
                kind,
                factor: self.extend_factor,
            });
        }
        Ok(())
    }
}

/// Startup-assembled policy table. Kinds without an override use their
/// built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    retry: HashMap<OperationKind, RetryConfig>,
    timeout: HashMap<OperationKind, TimeoutConfig>,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the retry policy for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if the config is out of range.
    pub fn with_retry(mut self, kind: OperationKind, config: RetryConfig) -> Result<Self, PolicyError> {
        config.validate(kind)?;
        self.retry.insert(kind, config);
        Ok(self)
    }

    /// Override the timeout policy for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if the config is out of range.
    pub fn with_timeout(mut self, kind: OperationKind, config: TimeoutConfig) -> Result<Self, PolicyError> {
        config.validate(kind)?;
        self.timeout.insert(kind, config);
        Ok(self)
    }

    #[must_use]
    pub fn retry(&self, kind: OperationKind) -> RetryConfig {
        self.retry
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| RetryConfig::for_kind(kind))
    }

    #[must_use]
    pub fn timeout(&self, kind: OperationKind) -> TimeoutConfig {
        self.timeout
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| TimeoutConfig::for_kind(kind))
    }

    #[must_use]
    pub fn is_overridden(&self, kind: OperationKind) -> bool {
        self.retry.contains_key(&kind) || self.timeout.contains_key(&kind)
    }

    /// Parse a label from the command layer.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownOperationKind`] for labels that name no kind.
    pub fn resolve(&self, label: &str) -> Result<OperationKind, UnknownOperationKind> {
        label.parse()
    }
}
