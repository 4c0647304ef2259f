//! Monitoring middleware: times every action, records its outcome and writes
//! the audit event.
//!
//! Sits outermost so that local failures (queue overflow, queue timeout) are
//! recorded just like remote ones. An action whose caller stops waiting is
//! recorded as a `cancelled` failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use modguard_core::{ActorId, AuditOutcome, ModerationAuditEvent, OperationKind, SubjectId};
use tower::{Layer, Service};
use tracing::{info_span, warn, Instrument};

use crate::error::ExecutionError;
use crate::monitor::{ModerationMonitor, OperationStart};
use crate::service::action::{ActionOutcome, ModerationAction};

/// Error token for actions dropped before they finished.
const CANCELLED: &str = "cancelled";

// ---------------------------------------------------------------------------
// MonitorLayer
// ---------------------------------------------------------------------------

/// Tower layer bracketing each action with
/// [`ModerationMonitor::start_operation`] / [`ModerationMonitor::end_operation`].
#[derive(Clone)]
pub struct MonitorLayer {
    monitor: Arc<ModerationMonitor>,
}

impl MonitorLayer {
    #[must_use]
    pub fn new(monitor: Arc<ModerationMonitor>) -> Self {
        Self { monitor }
    }
}

impl<S> Layer<S> for MonitorLayer {
    type Service = MonitorService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MonitorService {
            inner,
            monitor: Arc::clone(&self.monitor),
        }
    }
}

// ---------------------------------------------------------------------------
// MonitorService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MonitorService<S> {
    inner: S,
    monitor: Arc<ModerationMonitor>,
}

impl<S> Service<ModerationAction> for MonitorService<S>
where
    S: Service<ModerationAction, Response = ActionOutcome, Error = ExecutionError> + Send,
    S::Future: Send + 'static,
{
    type Response = ActionOutcome;
    type Error = ExecutionError;
    type Future = Pin<Box<dyn Future<Output = Result<ActionOutcome, ExecutionError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, action: ModerationAction) -> Self::Future {
        let span = info_span!(
            "moderation_action",
            kind = %action.kind,
            subject = %action.subject,
            actor = %action.actor,
            outcome = tracing::field::Empty,
        );

        let mut bracket = Bracket::open(Arc::clone(&self.monitor), &action);
        let fut = self.inner.call(action);

        Box::pin(
            async move {
                let result = fut.await;
                tracing::Span::current().record("outcome", if result.is_ok() { "success" } else { "failure" });
                bracket.settle(&result);
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Bracket
// ---------------------------------------------------------------------------

/// One open operation on the monitor.
///
/// Settled with the action's result on completion. If the caller drops the
/// future first, the operation is closed as a `cancelled` failure on drop so
/// the in-flight count and audit trail stay accurate.
struct Bracket {
    monitor: Arc<ModerationMonitor>,
    start: Option<OperationStart>,
    kind: OperationKind,
    subject: SubjectId,
    actor: ActorId,
    reason: Option<String>,
}

impl Bracket {
    fn open(monitor: Arc<ModerationMonitor>, action: &ModerationAction) -> Self {
        let start = monitor.start_operation(action.kind);
        Self {
            monitor,
            start: Some(start),
            kind: action.kind,
            subject: action.subject,
            actor: action.actor,
            reason: action.reason.clone(),
        }
    }

    fn settle(&mut self, result: &Result<ActionOutcome, ExecutionError>) {
        let Some(start) = self.start.take() else {
            return;
        };
        let event = match result {
            Ok(outcome) => {
                let latency = self.monitor.end_operation(start, true, None, Some(&outcome.result));
                self.event(AuditOutcome::Success, latency)
                    .with_side_effects(outcome.notified, outcome.case_id.is_some())
            }
            Err(err) => self.failed(start, err.tagged_message()),
        };
        self.monitor.record_audit_event(event.with_reason(self.reason.take()));
    }

    fn failed(&self, start: OperationStart, message: String) -> ModerationAuditEvent {
        let latency = self.monitor.end_operation(start, false, Some(&message), None);
        self.event(AuditOutcome::Failure, latency).with_error(message)
    }

    fn event(&self, outcome: AuditOutcome, latency: Duration) -> ModerationAuditEvent {
        ModerationAuditEvent::new(
            self.monitor.now_millis(),
            self.kind,
            self.subject,
            self.actor,
            outcome,
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        )
    }
}

impl Drop for Bracket {
    fn drop(&mut self) {
        let Some(start) = self.start.take() else {
            return;
        };
        warn!(kind = %self.kind, subject = %self.subject, "action dropped before completing");
        let message = format!("{CANCELLED}: {} on subject {} dropped before completing", self.kind, self.subject);
        let event = self.failed(start, message);
        self.monitor.record_audit_event(event.with_reason(self.reason.take()));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
