//! Tiered deadlines for the steps of a moderation action.
//!
//! The primary remote call may degrade gracefully: after its first timeout it
//! is re-invoked with a geometrically longer budget a bounded number of times.
//! Notifications are best-effort and never fail the action. Case-record writes
//! and auxiliary API calls have their own budgets and always propagate.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use modguard_core::{OperationKind, RemoteError};
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use super::policy::PolicyRegistry;
use crate::error::ExecutionError;

/// Which budget a deadline was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutTier {
    Operation,
    Notification,
    Persistence,
    ExternalApi,
}

impl TimeoutTier {
    pub const ALL: [Self; 4] = [
        Self::Operation,
        Self::Notification,
        Self::Persistence,
        Self::ExternalApi,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Operation => "operation",
            Self::Notification => "notification",
            Self::Persistence => "persistence",
            Self::ExternalApi => "external_api",
        }
    }
}

impl fmt::Display for TimeoutTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn timed_out(kind: OperationKind, tier: TimeoutTier, budget: Duration) -> ExecutionError {
    ExecutionError::Timeout {
        kind,
        tier,
        timeout_ms: millis(budget),
    }
}

/// Applies the per-kind [`TimeoutConfig`](super::TimeoutConfig) budgets.
#[derive(Clone)]
pub struct TimeoutHandler {
    policies: Arc<PolicyRegistry>,
}

impl TimeoutHandler {
    #[must_use]
    pub fn new(policies: Arc<PolicyRegistry>) -> Self {
        Self { policies }
    }

    /// Run the primary remote call under the operation budget.
    ///
    /// With graceful degradation a timed-out call is re-invoked up to
    /// `max_extend_attempts` times at `operation_timeout * extend_factor^(n+1)`.
    /// An extension is skipped once the time already spent exceeds twice the
    /// next budget.
    ///
    /// # Errors
    ///
    /// `f`'s own error, or [`ExecutionError::Timeout`] with the last budget
    /// tried once every allowed attempt has timed out.
    pub async fn execute_with_timeout<F, Fut, T>(&self, kind: OperationKind, mut f: F) -> Result<T, ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        let policy = self.policies.timeout(kind);
        let started = Instant::now();
        let mut budget = policy.operation_timeout;

        if let Ok(result) = timeout(budget, f()).await {
            return result;
        }
        if !policy.graceful_degradation {
            warn!(%kind, timeout_ms = millis(budget), "operation timed out");
            return Err(timed_out(kind, TimeoutTier::Operation, budget));
        }

        for attempt in 0..policy.max_extend_attempts {
            let next = policy.extended_timeout(attempt);
            let spent = started.elapsed();
            if spent > next.saturating_mul(2) {
                warn!(
                    %kind,
                    spent_ms = millis(spent),
                    next_timeout_ms = millis(next),
                    "operation is running away, not extending"
                );
                break;
            }

            info!(
                %kind,
                attempt = attempt + 1,
                timeout_ms = millis(next),
                "operation timed out, retrying with extended deadline"
            );
            budget = next;
            if let Ok(result) = timeout(budget, f()).await {
                return result;
            }
        }

        warn!(
            %kind,
            timeout_ms = millis(budget),
            elapsed_ms = millis(started.elapsed()),
            "operation timed out after extensions"
        );
        Err(timed_out(kind, TimeoutTier::Operation, budget))
    }

    /// Best-effort notification. Timeouts and failures are logged and
    /// swallowed.
    pub async fn execute_notification<Fut, T>(&self, kind: OperationKind, fut: Fut) -> Option<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let budget = self.policies.timeout(kind).notification_timeout;
        match timeout(budget, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                warn!(%kind, error = %err, "notification failed, continuing");
                None
            }
            Err(_) => {
                warn!(%kind, timeout_ms = millis(budget), "notification timed out, continuing");
                None
            }
        }
    }

    /// Case-record write under the persistence budget. Never degrades.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::Persistence`] wrapping the write's failure, or
    /// [`ExecutionError::Timeout`] on the persistence tier.
    pub async fn execute_persistence<Fut, T>(&self, kind: OperationKind, fut: Fut) -> Result<T, ExecutionError>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let budget = self.policies.timeout(kind).persistence_timeout;
        match timeout(budget, fut).await {
            Ok(result) => result.map_err(ExecutionError::Persistence),
            Err(_) => {
                warn!(%kind, timeout_ms = millis(budget), "case record timed out");
                Err(timed_out(kind, TimeoutTier::Persistence, budget))
            }
        }
    }

    /// Auxiliary remote API call under its own budget.
    ///
    /// # Errors
    ///
    /// The call's [`RemoteError`], or [`ExecutionError::Timeout`] on the
    /// external-API tier.
    pub async fn execute_external_api<Fut, T>(&self, kind: OperationKind, fut: Fut) -> Result<T, ExecutionError>
    where
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let budget = self.policies.timeout(kind).external_api_timeout;
        match timeout(budget, fut).await {
            Ok(result) => result.map_err(ExecutionError::from),
            Err(_) => {
                warn!(%kind, timeout_ms = millis(budget), "external api call timed out");
                Err(timed_out(kind, TimeoutTier::ExternalApi, budget))
            }
        }
    }
}
