//! Per-subject serialization of moderation actions.
//!
//! [`LockManager`] guarantees that at most one action per [`SubjectId`] is in
//! flight and that actions on the same subject complete in arrival order.
//! Actions on distinct subjects run fully concurrently.
//!
//! A caller that finds the subject free runs immediately and, once done,
//! drains everyone who queued behind it before returning. A caller that finds
//! the subject held joins a bounded FIFO queue and waits on a oneshot for its
//! turn. The try-lock/enqueue decision and the drain's final empty-check both
//! happen under the queue-table mutex, so no waiter can slip in after the last
//! drain pass.

mod queue;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use modguard_core::SubjectId;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use self::queue::{QueueItem, QueueJob, SubjectQueues};
use crate::config::LockConfig;
use crate::monitor::ModerationMonitor;

/// Failures produced by the serializer itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("queue for subject {subject} is full ({capacity} waiting)")]
    QueueCapacityExceeded { subject: SubjectId, capacity: usize },
    #[error("gave up after {waited:?} waiting for subject {subject}")]
    QueueTimeout { subject: SubjectId, waited: Duration },
}

/// Point-in-time view of the lock and queue tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    pub tracked_locks: usize,
    pub held_locks: usize,
    pub queued_subjects: usize,
    pub queued_operations: usize,
}

struct LockTable {
    config: LockConfig,
    locks: DashMap<SubjectId, Arc<Mutex<()>>>,
    queues: parking_lot::Mutex<SubjectQueues>,
    next_ticket: AtomicU64,
    monitor: Option<Arc<ModerationMonitor>>,
}

/// Serializes operations per subject. Cheap to clone; clones share tables.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockTable>,
}

enum Admission<F, R> {
    Immediate(OwnedMutexGuard<()>, F),
    Queued { ticket: u64, depth: usize, rx: R },
    Full,
}

impl LockManager {
    #[must_use]
    pub fn new(config: LockConfig) -> Self {
        Self::build(config, None)
    }

    /// Like [`LockManager::new`], reporting contention to `monitor`.
    #[must_use]
    pub fn with_monitor(config: LockConfig, monitor: Arc<ModerationMonitor>) -> Self {
        Self::build(config, Some(monitor))
    }

    fn build(config: LockConfig, monitor: Option<Arc<ModerationMonitor>>) -> Self {
        Self {
            inner: Arc::new(LockTable {
                config,
                locks: DashMap::new(),
                queues: parking_lot::Mutex::new(SubjectQueues::default()),
                next_ticket: AtomicU64::new(1),
                monitor,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    /// Return the subject's mutex, creating it if absent.
    ///
    /// Compacts idle locks when the table has grown past
    /// `cleanup_threshold`.
    pub fn acquire(&self, subject: SubjectId) -> Arc<Mutex<()>> {
        let lock = self
            .inner
            .locks
            .entry(subject)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        if self.inner.locks.len() > self.inner.config.cleanup_threshold {
            let removed = self.cleanup();
            debug!(removed, remaining = self.inner.locks.len(), "compacted subject lock table");
        }

        lock
    }

    /// Remove locks that are unlocked, have no waiters and are referenced only
    /// by the table. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        let queues = self.inner.queues.lock();
        let before = self.inner.locks.len();
        self.inner.locks.retain(|subject, lock| {
            Arc::strong_count(lock) > 1 || lock.try_lock().is_err() || queues.contains(*subject)
        });
        before.saturating_sub(self.inner.locks.len())
    }

    /// Run `op` with exclusive access to `subject`.
    ///
    /// Runs immediately when the subject is free, draining any callers that
    /// queue up meanwhile before returning. Otherwise waits in the subject's
    /// queue for at most `queue_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `op`'s own error, or a [`LockError`] converted into `E` when the
    /// queue is full or the wait expires.
    pub async fn execute_serialized<F, Fut, T, E>(&self, subject: SubjectId, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<LockError> + Send + 'static,
    {
        let lock = self.acquire(subject);
        let capacity = self.inner.config.queue_capacity;

        let admission = {
            let mut queues = self.inner.queues.lock();
            if let Ok(guard) = Arc::clone(&lock).try_lock_owned() {
                Admission::Immediate(guard, op)
            } else if queues.len(subject) >= capacity {
                Admission::Full
            } else {
                let (tx, rx) = oneshot::channel::<Result<T, E>>();
                let job: QueueJob = Box::new(move || {
                    Box::pin(async move {
                        // The waiter may have timed out and dropped its receiver.
                        let _ = tx.send(op().await);
                    })
                });
                let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
                let depth = queues.push(subject, QueueItem::new(ticket, job));
                Admission::Queued { ticket, depth, rx }
            }
        };
        drop(lock);

        match admission {
            Admission::Immediate(guard, op) => {
                let mut occupancy = Occupancy::new(self.clone(), subject, guard);
                let result = op().await;
                occupancy.drain().await;
                result
            }
            Admission::Full => {
                warn!(%subject, capacity, "subject queue full, rejecting operation");
                Err(LockError::QueueCapacityExceeded { subject, capacity }.into())
            }
            Admission::Queued { ticket, depth, rx } => {
                if let Some(monitor) = &self.inner.monitor {
                    monitor.record_lock_contention();
                }
                self.publish_depth();
                debug!(%subject, ticket, depth, "subject busy, queued operation");
                self.await_turn(subject, ticket, rx).await
            }
        }
    }

    async fn await_turn<T, E>(
        &self,
        subject: SubjectId,
        ticket: u64,
        rx: oneshot::Receiver<Result<T, E>>,
    ) -> Result<T, E>
    where
        E: From<LockError>,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.inner.config.queue_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!(%subject, ticket, "queued operation abandoned before completing");
                Err(LockError::QueueTimeout {
                    subject,
                    waited: started.elapsed(),
                }
                .into())
            }
            Err(_) => {
                let removed = self.inner.queues.lock().remove(subject, ticket);
                self.publish_depth();
                warn!(%subject, ticket, removed, "timed out waiting for subject lock");
                Err(LockError::QueueTimeout {
                    subject,
                    waited: started.elapsed(),
                }
                .into())
            }
        }
    }

    /// Callers currently waiting on `subject`.
    #[must_use]
    pub fn queue_len(&self, subject: SubjectId) -> usize {
        self.inner.queues.lock().len(subject)
    }

    /// Callers waiting across all subjects.
    #[must_use]
    pub fn total_queued(&self) -> usize {
        self.inner.queues.lock().total()
    }

    #[must_use]
    pub fn is_locked(&self, subject: SubjectId) -> bool {
        self.inner
            .locks
            .get(&subject)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Number of locks currently in the table, held or idle.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.inner.locks.len()
    }

    #[must_use]
    pub fn stats(&self) -> LockStats {
        let (queued_subjects, queued_operations) = {
            let queues = self.inner.queues.lock();
            (queues.subjects(), queues.total())
        };
        let held_locks = self
            .inner
            .locks
            .iter()
            .filter(|entry| entry.value().try_lock().is_err())
            .count();
        LockStats {
            tracked_locks: self.inner.locks.len(),
            held_locks,
            queued_subjects,
            queued_operations,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_depth(&self) {
        metrics::gauge!("modguard_queue_depth").set(self.total_queued() as f64);
    }
}

/// Ownership of a subject's lock by the caller that found it free.
///
/// Draining on the normal path happens inline. If the owning future is
/// dropped while the lock is still held, the remaining queue is drained on a
/// spawned task so queued callers are not stranded.
struct Occupancy {
    manager: LockManager,
    subject: SubjectId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Occupancy {
    fn new(manager: LockManager, subject: SubjectId, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            manager,
            subject,
            guard: Some(guard),
        }
    }

    /// Run queued operations one at a time, oldest first, until the queue is
    /// empty; then release the lock.
    async fn drain(&mut self) {
        loop {
            let next = {
                let mut queues = self.manager.inner.queues.lock();
                if let Some(item) = queues.pop(self.subject) {
                    item
                } else {
                    // Released under the queue mutex: a concurrent caller
                    // either sees the lock free or is already queued and popped above.
                    self.guard.take();
                    return;
                }
            };
            self.manager.publish_depth();
            debug!(
                subject = %self.subject,
                ticket = next.ticket,
                waited_ms = u64::try_from(next.enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "running queued operation"
            );
            next.run().await;
        }
    }
}

impl Drop for Occupancy {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(subject = %self.subject, "lock holder cancelled, draining queue in background");
                let mut rest = Occupancy::new(self.manager.clone(), self.subject, guard);
                handle.spawn(async move { rest.drain().await });
            }
            Err(_) => drop(guard),
        }
    }
}
