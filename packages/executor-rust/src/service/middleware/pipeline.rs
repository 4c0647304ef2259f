//! Pipeline composition: wraps the action handler with the middleware layers.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::monitor::{MonitorLayer, MonitorService};
use super::serialize::{SerializeLayer, SerializeService};
use crate::monitor::ModerationMonitor;
use crate::serialization::LockManager;
use crate::service::handler::ActionHandler;

/// The fully layered action service.
pub type ActionPipeline = MonitorService<SerializeService<ActionHandler>>;

/// Build the action pipeline around `handler`.
///
/// Layer order (outermost to innermost):
/// 1. `MonitorLayer` -- time, count and audit every action, local failures included
/// 2. `SerializeLayer` -- one action per subject at a time, FIFO
/// 3. `ActionHandler` -- notice, retried remote call, case record
#[must_use]
pub fn build_action_pipeline(
    handler: ActionHandler,
    locks: LockManager,
    monitor: Arc<ModerationMonitor>,
) -> ActionPipeline {
    ServiceBuilder::new()
        .layer(MonitorLayer::new(monitor))
        .layer(SerializeLayer::new(locks))
        .service(handler)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
