//! Tower middleware layers for the action pipeline.
//!
//! - [`monitor`]: timing, outcome counting and audit events
//! - [`serialize`]: per-subject mutual exclusion through the lock manager
//! - [`pipeline`]: composes the layers around the action handler

pub mod monitor;
pub mod pipeline;
pub mod serialize;

pub use monitor::MonitorLayer;
pub use pipeline::{build_action_pipeline, ActionPipeline};
pub use serialize::SerializeLayer;
