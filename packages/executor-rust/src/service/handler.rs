//! Innermost service: performs one action's steps under the resilience policies.
//!
//! Order per action:
//! 1. best-effort notice to the subject (before the action can make it unreachable)
//! 2. the remote action, retried under the kind's breaker and bounded by its
//!    operation timeout
//! 3. the case record, on the persistence tier

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use modguard_core::{ClockSource, OperationKind};
use tower::Service;
use tracing::debug;

use super::action::{ActionOutcome, ModerationAction};
use crate::error::ExecutionError;
use crate::resilience::{RetryHandler, TimeoutHandler};
use crate::traits::{CaseDraft, CaseRecorder, Notifier};

// ---------------------------------------------------------------------------
// ActionHandler
// ---------------------------------------------------------------------------

/// Tower service executing a [`ModerationAction`]. Always ready.
#[derive(Clone)]
pub struct ActionHandler {
    retry: Arc<RetryHandler>,
    timeouts: TimeoutHandler,
    clock: Arc<dyn ClockSource>,
    notifier: Option<Arc<dyn Notifier>>,
    recorder: Option<Arc<dyn CaseRecorder>>,
}

impl ActionHandler {
    #[must_use]
    pub fn new(retry: Arc<RetryHandler>, timeouts: TimeoutHandler, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            retry,
            timeouts,
            clock,
            notifier: None,
            recorder: None,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn with_case_recorder(mut self, recorder: Arc<dyn CaseRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    async fn handle(&self, action: ModerationAction) -> Result<ActionOutcome, ExecutionError> {
        let kind = action.kind;

        let notified = match (&action.notice, &self.notifier) {
            (Some(notice), Some(notifier)) => self
                .timeouts
                .execute_notification(OperationKind::Notification, notifier.notify(action.subject, notice))
                .await
                .is_some(),
            _ => false,
        };

        let result = self
            .timeouts
            .execute_with_timeout(kind, || {
                self.retry
                    .execute_with_retry(kind, || action.call_remote())
            })
            .await?;

        let case_id = match (&self.recorder, action.record_case) {
            (Some(recorder), true) => {
                let draft = CaseDraft {
                    kind,
                    subject: action.subject,
                    actor: action.actor,
                    reason: action.reason.clone(),
                    created_at_ms: self.clock.now_millis(),
                    remote_result: result.clone(),
                };
                let case_id = self
                    .timeouts
                    .execute_persistence(OperationKind::CaseRecord, recorder.record_case(draft))
                    .await?;
                debug!(%kind, subject = %action.subject, case_id, "case recorded");
                Some(case_id)
            }
            _ => None,
        };

        Ok(ActionOutcome {
            kind,
            subject: action.subject,
            result,
            notified,
            case_id,
        })
    }
}

impl Service<ModerationAction> for ActionHandler {
    type Response = ActionOutcome;
    type Error = ExecutionError;
    type Future = Pin<Box<dyn Future<Output = Result<ActionOutcome, ExecutionError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, action: ModerationAction) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { handler.handle(action).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use modguard_core::{ActorId, ManualClock, RemoteError, SubjectId};
    use tower::ServiceExt;

    use super::*;
    use crate::resilience::{PolicyRegistry, RetryConfig};
    use crate::traits::Notice;

    struct CountingNotifier {
        sent: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _subject: SubjectId, _notice: &Notice) -> anyhow::Result<()> {
            if self.fail {
                return Err(anyhow!("dms closed"));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SequenceRecorder {
        next: AtomicU64,
    }

    #[async_trait]
    impl CaseRecorder for SequenceRecorder {
        async fn record_case(&self, draft: CaseDraft) -> anyhow::Result<u64> {
            assert_eq!(draft.created_at_ms, 9_000);
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    struct BrokenRecorder;

    #[async_trait]
    impl CaseRecorder for BrokenRecorder {
        async fn record_case(&self, _draft: CaseDraft) -> anyhow::Result<u64> {
            Err(anyhow!("connection refused"))
        }
    }

    fn handler(policies: PolicyRegistry) -> ActionHandler {
        let policies = Arc::new(policies);
        ActionHandler::new(
            Arc::new(RetryHandler::new(Arc::clone(&policies))),
            TimeoutHandler::new(policies),
            Arc::new(ManualClock::new(9_000)),
        )
    }

    fn ban(remote_calls: Arc<AtomicU32>) -> ModerationAction {
        ModerationAction::new(OperationKind::Ban, SubjectId(42), ActorId(1), move || {
            let remote_calls = Arc::clone(&remote_calls);
            async move {
                remote_calls.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({ "banned": 42 }))
            }
        })
    }

    #[tokio::test]
    async fn runs_notice_action_and_case_record() {
        let notifier = Arc::new(CountingNotifier {
            sent: AtomicU32::new(0),
            fail: false,
        });
        let handler = handler(PolicyRegistry::new())
            .with_notifier(notifier.clone())
            .with_case_recorder(Arc::new(SequenceRecorder {
                next: AtomicU64::new(100),
            }));
        let calls = Arc::new(AtomicU32::new(0));
        let action = ban(Arc::clone(&calls))
            .with_notice(Notice::new("Banned", "You were banned."))
            .with_case_record();

        let outcome = handler.oneshot(action).await.unwrap();

        assert!(outcome.notified);
        assert_eq!(outcome.case_id, Some(100));
        assert_eq!(outcome.result["banned"], 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_notice_does_not_fail_action() {
        let handler = handler(PolicyRegistry::new()).with_notifier(Arc::new(CountingNotifier {
            sent: AtomicU32::new(0),
            fail: true,
        }));
        let action = ban(Arc::new(AtomicU32::new(0))).with_notice(Notice::new("Banned", "bye"));

        let outcome = handler.oneshot(action).await.unwrap();
        assert!(!outcome.notified);
        assert_eq!(outcome.case_id, None);
    }

    #[tokio::test]
    async fn case_record_failure_propagates() {
        let handler = handler(PolicyRegistry::new()).with_case_recorder(Arc::new(BrokenRecorder));
        let calls = Arc::new(AtomicU32::new(0));
        let action = ban(Arc::clone(&calls)).with_case_record();

        let err = handler.oneshot(action).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Persistence(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failures_are_retried() {
        let policies = PolicyRegistry::new()
            .with_retry(
                OperationKind::Warn,
                RetryConfig {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(100),
                    jitter: false,
                    ..RetryConfig::default()
                },
            )
            .unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let action = ModerationAction::new(OperationKind::Warn, SubjectId(5), ActorId(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RemoteError::server(503, "unavailable"))
                } else {
                    Ok(serde_json::Value::Null)
                }
            }
        });

        handler(policies).oneshot(action).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
