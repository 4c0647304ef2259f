//! Action execution pipeline.
//!
//! 1. **Actions** (`action`): `ModerationAction` in, `ActionOutcome` out
//! 2. **Handler** (`handler`): notice, retried remote call, case record
//! 3. **Middleware** (`middleware`): Tower layers (monitoring, per-subject serialization)
//! 4. **Executor** (`executor`): wires everything once at startup
//! 5. **Background workers** (`worker`): periodic maintenance

pub mod action;
pub mod executor;
pub mod handler;
pub mod middleware;
pub mod worker;

pub use action::{ActionOutcome, ModerationAction, RemoteCall, RemoteFuture};
pub use executor::{ExecutorBuilder, ModerationExecutor};
pub use handler::ActionHandler;
pub use middleware::{build_action_pipeline, ActionPipeline, MonitorLayer, SerializeLayer};
pub use worker::{BackgroundRunnable, BackgroundWorker, MaintenanceRunnable, MaintenanceTask, SweepReport};
