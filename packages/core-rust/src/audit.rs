//! Completed-action records kept for review.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ActorId, OperationKind, Severity, SubjectId};

/// How a moderation action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// Immutable record of one completed moderation action.
///
/// Written once, after the action's final outcome is known, whether it
/// succeeded or failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationAuditEvent {
    pub id: Uuid,
    /// Completion time, milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    pub kind: OperationKind,
    pub subject: SubjectId,
    pub actor: ActorId,
    pub outcome: AuditOutcome,
    pub latency_ms: u64,
    /// Rendered error for failed actions.
    pub error: Option<String>,
    /// Whether the subject was told about the action.
    pub notified: bool,
    /// Whether a case record was persisted.
    pub case_recorded: bool,
    pub reason: Option<String>,
}

impl ModerationAuditEvent {
    /// Start a record with a fresh id; side-effect flags default to `false`.
    #[must_use]
    pub fn new(
        timestamp_ms: u64,
        kind: OperationKind,
        subject: SubjectId,
        actor: ActorId,
        outcome: AuditOutcome,
        latency_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp_ms,
            kind,
            subject,
            actor,
            outcome,
            latency_ms,
            error: None,
            notified: false,
            case_recorded: false,
            reason: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    #[must_use]
    pub fn with_side_effects(mut self, notified: bool, case_recorded: bool) -> Self {
        self.notified = notified;
        self.case_recorded = case_recorded;
        self
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome == AuditOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_flags_and_error() {
        let event = ModerationAuditEvent::new(
            1_700_000_000_000,
            OperationKind::Ban,
            SubjectId(7),
            ActorId(1),
            AuditOutcome::Failure,
            120,
        )
        .with_error("breaker_open: circuit breaker open for ban")
        .with_reason(Some("spam".to_string()))
        .with_side_effects(true, false);

        assert!(!event.succeeded());
        assert!(event.notified);
        assert!(!event.case_recorded);
        assert_eq!(event.severity(), Severity::High);
        assert_eq!(event.reason.as_deref(), Some("spam"));
    }

    #[test]
    fn ids_are_unique() {
        let a = ModerationAuditEvent::new(0, OperationKind::Note, SubjectId(1), ActorId(1), AuditOutcome::Success, 0);
        let b = ModerationAuditEvent::new(0, OperationKind::Note, SubjectId(1), ActorId(1), AuditOutcome::Success, 0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn serializes_with_snake_case_labels() {
        let event = ModerationAuditEvent::new(
            5,
            OperationKind::RemoveTimeout,
            SubjectId(9),
            ActorId(2),
            AuditOutcome::Success,
            3,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "remove_timeout");
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["subject"], 9);
    }
}
