//! Per-subject FIFO queues of callers waiting for a held subject lock.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;

use modguard_core::SubjectId;
use tokio::time::Instant;

/// Type-erased queued work. Running it executes the caller's operation and
/// resolves the caller's oneshot with the result.
pub(crate) type QueueJob = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A caller waiting its turn on a subject.
pub(crate) struct QueueItem {
    pub(crate) ticket: u64,
    pub(crate) enqueued_at: Instant,
    job: QueueJob,
}

impl QueueItem {
    pub(crate) fn new(ticket: u64, job: QueueJob) -> Self {
        Self {
            ticket,
            enqueued_at: Instant::now(),
            job,
        }
    }

    /// Execute the queued operation; consumes the item so it runs at most once.
    pub(crate) async fn run(self) {
        (self.job)().await;
    }
}

/// Queue table keyed by subject. Empty queues are removed eagerly.
#[derive(Default)]
pub(crate) struct SubjectQueues {
    queues: HashMap<SubjectId, VecDeque<QueueItem>>,
}

impl SubjectQueues {
    pub(crate) fn len(&self, subject: SubjectId) -> usize {
        self.queues.get(&subject).map_or(0, VecDeque::len)
    }

    pub(crate) fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub(crate) fn subjects(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn contains(&self, subject: SubjectId) -> bool {
        self.queues.contains_key(&subject)
    }

    /// Append to the subject's queue. Returns the new depth.
    pub(crate) fn push(&mut self, subject: SubjectId, item: QueueItem) -> usize {
        let queue = self.queues.entry(subject).or_default();
        queue.push_back(item);
        queue.len()
    }

    /// Take the oldest waiter for `subject`, deleting the queue once empty.
    pub(crate) fn pop(&mut self, subject: SubjectId) -> Option<QueueItem> {
        let queue = self.queues.get_mut(&subject)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&subject);
        }
        item
    }

    /// Remove a specific waiter. Returns `false` if it was already taken.
    pub(crate) fn remove(&mut self, subject: SubjectId, ticket: u64) -> bool {
        let Some(queue) = self.queues.get_mut(&subject) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|item| item.ticket != ticket);
        let removed = queue.len() < before;
        if queue.is_empty() {
            self.queues.remove(&subject);
        }
        removed
    }
}
