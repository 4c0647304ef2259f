use async_trait::async_trait;
use modguard_core::{ActorId, OperationKind, SubjectId};
use serde::{Deserialize, Serialize};

/// Message delivered to the subject of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub body: String,
}

impl Notice {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Case record handed to the persistence layer once the remote action succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDraft {
    pub kind: OperationKind,
    pub subject: SubjectId,
    pub actor: ActorId,
    pub reason: Option<String>,
    /// Completion time, milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Whatever the remote service returned for the action.
    pub remote_result: serde_json::Value,
}

/// Delivers notices to subjects (direct message, fallback channel, ...).
/// Delivery is best-effort; failures never fail the action.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: SubjectId, notice: &Notice) -> anyhow::Result<()>;
}

/// Persists case records. Returns the new case number.
#[async_trait]
pub trait CaseRecorder: Send + Sync {
    async fn record_case(&self, draft: CaseDraft) -> anyhow::Result<u64>;
}
