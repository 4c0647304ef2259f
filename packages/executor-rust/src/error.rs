//! The closed failure set returned by every execution entry point.

use modguard_core::{FailureClass, OperationKind, RemoteError, SubjectId, UnknownOperationKind};

use crate::resilience::timeout::TimeoutTier;
use crate::serialization::LockError;

/// Errors returned by the execution layer.
///
/// Local synthetic failures (`BreakerOpen`, `QueueCapacityExceeded`,
/// `QueueTimeout`) are never retried. `Remote` carries the invoker's own
/// failure unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("circuit breaker open for {kind}")]
    BreakerOpen { kind: OperationKind },
    #[error("{kind} {tier} call timed out after {timeout_ms}ms")]
    Timeout {
        kind: OperationKind,
        tier: TimeoutTier,
        timeout_ms: u64,
    },
    #[error("queue for subject {subject} is full ({capacity} waiting)")]
    QueueCapacityExceeded { subject: SubjectId, capacity: usize },
    #[error("gave up after {waited_ms}ms waiting for subject {subject}")]
    QueueTimeout { subject: SubjectId, waited_ms: u64 },
    #[error(transparent)]
    UnknownOperation(#[from] UnknownOperationKind),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("case record failed: {0}")]
    Persistence(#[source] anyhow::Error),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Coarse grouping callers use to pick a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Too much local load: queue full or queue wait expired.
    Overload,
    /// The remote service is failing or known to be unhealthy.
    RemoteOutage,
    /// The remote service refused the action.
    PermissionDenied,
    /// The target no longer exists.
    NotFound,
    /// A deadline expired.
    Timeout,
    /// Anything else: persistence, configuration, local bugs.
    Other,
}

impl ExecutionError {
    /// Stable snake_case token naming the failure, used as the leading token
    /// of monitor error strings and as a metrics label.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Timeout { .. } => "timeout",
            Self::QueueCapacityExceeded { .. } => "queue_full",
            Self::QueueTimeout { .. } => "queue_timeout",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::Remote(err) => err.class.as_str(),
            Self::Persistence(_) => "persistence",
            Self::Internal(_) => "internal",
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::QueueCapacityExceeded { .. } | Self::QueueTimeout { .. } => ErrorCategory::Overload,
            Self::BreakerOpen { .. } => ErrorCategory::RemoteOutage,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Remote(err) => match err.class {
                FailureClass::Permission => ErrorCategory::PermissionDenied,
                FailureClass::NotFound => ErrorCategory::NotFound,
                FailureClass::RateLimited { .. } | FailureClass::Server | FailureClass::Unclassified => {
                    ErrorCategory::RemoteOutage
                }
                FailureClass::Internal => ErrorCategory::Other,
            },
            Self::UnknownOperation(_) | Self::Persistence(_) | Self::Internal(_) => ErrorCategory::Other,
        }
    }

    /// Whether the failure was produced locally rather than by the remote service.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::BreakerOpen { .. } | Self::QueueCapacityExceeded { .. } | Self::QueueTimeout { .. }
        )
    }

    /// `"<tag>: <message>"`, the form recorded by the monitor.
    #[must_use]
    pub fn tagged_message(&self) -> String {
        format!("{}: {self}", self.tag())
    }
}

impl From<LockError> for ExecutionError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::QueueCapacityExceeded { subject, capacity } => {
                Self::QueueCapacityExceeded { subject, capacity }
            }
            LockError::QueueTimeout { subject, waited } => Self::QueueTimeout {
                subject,
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn tags_are_stable() {
        let err = ExecutionError::BreakerOpen {
            kind: OperationKind::Ban,
        };
        assert_eq!(err.tag(), "breaker_open");
        assert_eq!(err.tagged_message(), "breaker_open: circuit breaker open for ban");

        let err = ExecutionError::Remote(RemoteError::permission("missing ban_members"));
        assert_eq!(err.tag(), "permission");
    }

    #[test]
    fn categories_separate_overload_outage_and_permission() {
        let overload: ExecutionError = LockError::QueueCapacityExceeded {
            subject: SubjectId(1),
            capacity: 10,
        }
        .into();
        assert_eq!(overload.category(), ErrorCategory::Overload);
        assert!(overload.is_local());

        let outage = ExecutionError::BreakerOpen {
            kind: OperationKind::Kick,
        };
        assert_eq!(outage.category(), ErrorCategory::RemoteOutage);

        let denied = ExecutionError::Remote(RemoteError::permission("nope"));
        assert_eq!(denied.category(), ErrorCategory::PermissionDenied);
        assert!(!denied.is_local());
    }

    #[test]
    fn queue_timeout_converts_to_millis() {
        let err: ExecutionError = LockError::QueueTimeout {
            subject: SubjectId(42),
            waited: Duration::from_millis(1500),
        }
        .into();
        assert!(matches!(
            err,
            ExecutionError::QueueTimeout {
                subject: SubjectId(42),
                waited_ms: 1500
            }
        ));
        assert_eq!(err.to_string(), "gave up after 1500ms waiting for subject 42");
    }

    #[test]
    fn timeout_display_names_tier() {
        let err = ExecutionError::Timeout {
            kind: OperationKind::CaseRecord,
            tier: TimeoutTier::Persistence,
            timeout_ms: 10_000,
        };
        assert_eq!(err.to_string(), "case_record persistence call timed out after 10000ms");
    }
}
