//! Per-subject serialization middleware.
//!
//! Hands every action to [`LockManager::execute_serialized`] keyed by the
//! action's subject, so the inner service only ever sees one action per
//! subject at a time.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service, ServiceExt};

use crate::error::ExecutionError;
use crate::serialization::LockManager;
use crate::service::action::{ActionOutcome, ModerationAction};

// ---------------------------------------------------------------------------
// SerializeLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SerializeLayer {
    locks: LockManager,
}

impl SerializeLayer {
    #[must_use]
    pub fn new(locks: LockManager) -> Self {
        Self { locks }
    }
}

impl<S> Layer<S> for SerializeLayer {
    type Service = SerializeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SerializeService {
            inner,
            locks: self.locks.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// SerializeService
// ---------------------------------------------------------------------------

/// Runs the inner service with exclusive access to the action's subject.
///
/// The inner service is cloned per call and driven to readiness only once
/// the subject's turn arrives.
#[derive(Clone)]
pub struct SerializeService<S> {
    inner: S,
    locks: LockManager,
}

impl<S> Service<ModerationAction> for SerializeService<S>
where
    S: Service<ModerationAction, Response = ActionOutcome, Error = ExecutionError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ActionOutcome;
    type Error = ExecutionError;
    type Future = Pin<Box<dyn Future<Output = Result<ActionOutcome, ExecutionError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, action: ModerationAction) -> Self::Future {
        let inner = self.inner.clone();
        let locks = self.locks.clone();
        let subject = action.subject;

        Box::pin(async move {
            locks
                .execute_serialized(subject, move || inner.oneshot(action))
                .await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
