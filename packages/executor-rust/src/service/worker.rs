//! Caller-owned background maintenance.
//!
//! [`BackgroundWorker`] drives any [`BackgroundRunnable`] from an mpsc task
//! channel plus a periodic tick. [`MaintenanceRunnable`] is the runnable the
//! executor ships: it prunes the monitor's audit trail and compacts the
//! subject-lock table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::monitor::ModerationMonitor;
use crate::serialization::LockManager;

const TASK_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Work driven by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Handle one submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called once per tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once after the loop exits. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned worker loop.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawn the loop. The first tick fires one full interval after start.
    pub fn start(runnable: R, tick_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<R::Task>(TASK_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(drive(runnable, rx, stop_rx, tick_interval));

        Self {
            tx: Some(tx),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Queue a task for the loop.
    ///
    /// # Errors
    ///
    /// Fails once the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("worker not running"))?;
        tx.send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker channel closed"))
    }

    /// Signal the loop to exit and wait for `shutdown` to complete.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn drive<R: BackgroundRunnable>(
    mut runnable: R,
    mut rx: mpsc::Receiver<R::Task>,
    mut stop_rx: oneshot::Receiver<()>,
    tick_interval: Duration,
) {
    let mut ticks = tokio::time::interval(tick_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so on_tick waits a full interval.
    ticks.tick().await;

    loop {
        tokio::select! {
            task = rx.recv() => match task {
                Some(task) => runnable.run(task).await,
                None => break,
            },
            _ = ticks.tick() => runnable.on_tick().await,
            _ = &mut stop_rx => break,
        }
    }

    runnable.shutdown().await;
}

// ---------------------------------------------------------------------------
// MaintenanceRunnable
// ---------------------------------------------------------------------------

/// What one maintenance sweep removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub pruned_audit_events: usize,
    pub compacted_locks: usize,
}

/// On-demand maintenance requests.
#[derive(Debug)]
pub enum MaintenanceTask {
    /// Full sweep, as on a tick. The report is sent back when `reply` is set.
    Sweep {
        reply: Option<oneshot::Sender<SweepReport>>,
    },
    /// Prune audit events older than `max_age_hours` and reset counters.
    PruneAudit { max_age_hours: u64 },
    /// Drop idle subject locks.
    CompactLocks,
}

/// Periodic cleanup of monitor data and idle subject locks.
pub struct MaintenanceRunnable {
    monitor: Arc<ModerationMonitor>,
    locks: LockManager,
    audit_max_age_hours: u64,
    sweeps: u64,
}

impl MaintenanceRunnable {
    #[must_use]
    pub fn new(monitor: Arc<ModerationMonitor>, locks: LockManager, audit_max_age_hours: u64) -> Self {
        Self {
            monitor,
            locks,
            audit_max_age_hours,
            sweeps: 0,
        }
    }

    fn sweep(&mut self) -> SweepReport {
        self.sweeps += 1;
        let report = SweepReport {
            pruned_audit_events: self.monitor.clear_old_data(self.audit_max_age_hours),
            compacted_locks: self.locks.cleanup(),
        };
        info!(
            sweep = self.sweeps,
            pruned_audit_events = report.pruned_audit_events,
            compacted_locks = report.compacted_locks,
            "maintenance sweep complete"
        );
        report
    }
}

#[async_trait]
impl BackgroundRunnable for MaintenanceRunnable {
    type Task = MaintenanceTask;

    async fn run(&mut self, task: MaintenanceTask) {
        match task {
            MaintenanceTask::Sweep { reply } => {
                let report = self.sweep();
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            MaintenanceTask::PruneAudit { max_age_hours } => {
                self.monitor.clear_old_data(max_age_hours);
            }
            MaintenanceTask::CompactLocks => {
                let removed = self.locks.cleanup();
                debug!(removed, "compacted subject locks on request");
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }

    async fn shutdown(&mut self) {
        debug!(sweeps = self.sweeps, "maintenance worker stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use modguard_core::{
        ActorId, AuditOutcome, ClockSource, ManualClock, ModerationAuditEvent, OperationKind, SubjectId,
    };

    use super::*;
    use crate::config::{LockConfig, MonitorConfig};

    struct CountingRunnable {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = u32;

        async fn run(&mut self, _task: u32) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (CountingRunnable, Arc<AtomicU32>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let (runs, ticks, shutdowns) = (
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
        );
        let runnable = CountingRunnable {
            runs: Arc::clone(&runs),
            ticks: Arc::clone(&ticks),
            shutdowns: Arc::clone(&shutdowns),
        };
        (runnable, runs, ticks, shutdowns)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_tasks_ticks_and_stops() {
        let (runnable, runs, ticks, shutdowns) = counting();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_millis(100));
        assert!(worker.is_running());

        for task in 0..3 {
            worker.submit(task).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        worker.stop().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
        assert!(worker.submit(9).await.is_err());
    }

    #[tokio::test]
    async fn sweep_prunes_audit_and_compacts_locks() {
        let clock = ManualClock::new(100 * 3_600_000);
        let monitor = Arc::new(ModerationMonitor::with_clock(
            MonitorConfig::default(),
            Arc::new(clock.clone()),
        ));
        monitor.record_audit_event(ModerationAuditEvent::new(
            clock.now_millis(),
            OperationKind::Warn,
            SubjectId(1),
            ActorId(1),
            AuditOutcome::Success,
            1,
        ));
        monitor.record_lock_contention();
        clock.advance(48 * 3_600_000);

        let locks = LockManager::new(LockConfig::default());
        locks.acquire(SubjectId(1));
        locks.acquire(SubjectId(2));

        let mut worker = BackgroundWorker::start(
            MaintenanceRunnable::new(Arc::clone(&monitor), locks.clone(), 24),
            Duration::from_secs(3_600),
        );
        let (reply, report) = oneshot::channel();
        worker
            .submit(MaintenanceTask::Sweep { reply: Some(reply) })
            .await
            .unwrap();

        assert_eq!(
            report.await.unwrap(),
            SweepReport {
                pruned_audit_events: 1,
                compacted_locks: 2,
            }
        );
        assert_eq!(monitor.get_all_metrics().lock_contention, 0);
        assert_eq!(locks.lock_count(), 0);
        worker.stop().await;
    }
}
