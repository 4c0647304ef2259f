//! The execution layer's single entry point.

use std::sync::Arc;
use std::time::Duration;

use modguard_core::{ClockSource, OperationKind, SystemClock};
use tower::ServiceExt;
use tracing::info;

use super::action::{ActionOutcome, ModerationAction};
use super::handler::ActionHandler;
use super::middleware::{build_action_pipeline, ActionPipeline};
use super::worker::{BackgroundWorker, MaintenanceRunnable};
use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::monitor::ModerationMonitor;
use crate::resilience::{PolicyRegistry, RetryHandler, TimeoutHandler};
use crate::serialization::LockManager;
use crate::traits::{CaseRecorder, Notifier};

/// Owns the lock manager, monitor, retry and timeout handlers, and the
/// assembled pipeline. Build one per process and share it by reference.
pub struct ModerationExecutor {
    config: ExecutorConfig,
    monitor: Arc<ModerationMonitor>,
    locks: LockManager,
    retry: Arc<RetryHandler>,
    timeouts: TimeoutHandler,
    pipeline: ActionPipeline,
}

impl ModerationExecutor {
    /// Executor with default configuration and built-in policies, and no
    /// notifier or case recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Run `action` through monitoring, per-subject serialization and the
    /// resilience policies of its kind.
    ///
    /// # Errors
    ///
    /// Any [`ExecutionError`]; every failure has already been recorded by the
    /// monitor when this returns.
    pub async fn execute(&self, action: ModerationAction) -> Result<ActionOutcome, ExecutionError> {
        self.pipeline.clone().oneshot(action).await
    }

    /// Parse an operation label from the command layer.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::UnknownOperation`] for labels naming no kind.
    pub fn resolve_kind(&self, label: &str) -> Result<OperationKind, ExecutionError> {
        Ok(self.retry.policies().resolve(label)?)
    }

    /// Maintenance worker over this executor's monitor and lock table, ticking
    /// at `maintenance.interval_ms`. The caller owns stopping it.
    #[must_use]
    pub fn start_maintenance(&self) -> BackgroundWorker<MaintenanceRunnable> {
        let maintenance = &self.config.maintenance;
        info!(
            interval_ms = maintenance.interval_ms,
            audit_max_age_hours = maintenance.audit_max_age_hours,
            "starting maintenance worker"
        );
        BackgroundWorker::start(
            MaintenanceRunnable::new(
                Arc::clone(&self.monitor),
                self.locks.clone(),
                maintenance.audit_max_age_hours,
            ),
            Duration::from_millis(maintenance.interval_ms.max(1)),
        )
    }

    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<ModerationMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    #[must_use]
    pub fn retry(&self) -> &RetryHandler {
        &self.retry
    }

    #[must_use]
    pub fn timeouts(&self) -> &TimeoutHandler {
        &self.timeouts
    }
}

impl Default for ModerationExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Startup wiring for a [`ModerationExecutor`].
#[derive(Default)]
pub struct ExecutorBuilder {
    config: ExecutorConfig,
    policies: PolicyRegistry,
    clock: Option<Arc<dyn ClockSource>>,
    notifier: Option<Arc<dyn Notifier>>,
    recorder: Option<Arc<dyn CaseRecorder>>,
}

impl ExecutorBuilder {
    #[must_use]
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn case_recorder(mut self, recorder: Arc<dyn CaseRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    #[must_use]
    pub fn build(self) -> ModerationExecutor {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let monitor = Arc::new(ModerationMonitor::with_clock(
            self.config.monitor.clone(),
            Arc::clone(&clock),
        ));
        let locks = LockManager::with_monitor(self.config.lock.clone(), Arc::clone(&monitor));
        let policies = Arc::new(self.policies);
        let retry = Arc::new(RetryHandler::with_monitor(
            Arc::clone(&policies),
            Arc::clone(&monitor),
        ));
        let timeouts = TimeoutHandler::new(policies);

        let mut handler = ActionHandler::new(Arc::clone(&retry), timeouts.clone(), clock);
        if let Some(notifier) = self.notifier {
            handler = handler.with_notifier(notifier);
        }
        if let Some(recorder) = self.recorder {
            handler = handler.with_case_recorder(recorder);
        }
        let pipeline = build_action_pipeline(handler, locks.clone(), Arc::clone(&monitor));

        ModerationExecutor {
            config: self.config,
            monitor,
            locks,
            retry,
            timeouts,
            pipeline,
        }
    }
}
