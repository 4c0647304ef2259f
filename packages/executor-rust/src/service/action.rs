//! Request and response types flowing through the action pipeline.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use modguard_core::{ActorId, OperationKind, RemoteError, SubjectId};
use serde::Serialize;

use crate::traits::Notice;

/// Future returned by a [`RemoteCall`].
pub type RemoteFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, RemoteError>> + Send>>;

/// The remote action itself. Re-invocable: retries and timeout extensions
/// call it again from scratch.
pub type RemoteCall = Arc<dyn Fn() -> RemoteFuture + Send + Sync>;

/// One moderation action against one subject.
#[derive(Clone)]
pub struct ModerationAction {
    pub kind: OperationKind,
    pub subject: SubjectId,
    pub actor: ActorId,
    pub reason: Option<String>,
    pub remote: RemoteCall,
    /// Sent to the subject before the remote action runs.
    pub notice: Option<Notice>,
    pub record_case: bool,
}

impl ModerationAction {
    pub fn new<F, Fut>(kind: OperationKind, subject: SubjectId, actor: ActorId, remote: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RemoteError>> + Send + 'static,
    {
        Self {
            kind,
            subject,
            actor,
            reason: None,
            remote: Arc::new(move || -> RemoteFuture { Box::pin(remote()) }),
            notice: None,
            record_case: false,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_notice(mut self, notice: Notice) -> Self {
        self.notice = Some(notice);
        self
    }

    #[must_use]
    pub fn with_case_record(mut self) -> Self {
        self.record_case = true;
        self
    }

    /// Invoke the remote action once.
    pub fn call_remote(&self) -> RemoteFuture {
        (*self.remote)()
    }
}

impl fmt::Debug for ModerationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModerationAction")
            .field("kind", &self.kind)
            .field("subject", &self.subject)
            .field("actor", &self.actor)
            .field("reason", &self.reason)
            .field("notice", &self.notice)
            .field("record_case", &self.record_case)
            .finish_non_exhaustive()
    }
}

/// Result of a successful action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub kind: OperationKind,
    pub subject: SubjectId,
    /// Value returned by the remote service.
    pub result: serde_json::Value,
    pub notified: bool,
    /// Case number assigned by the recorder, when a case was written.
    pub case_id: Option<u64>,
}
