//! Bounded in-memory audit trail backing the monitor.

use std::collections::VecDeque;

use modguard_core::{ModerationAuditEvent, SubjectId};

/// Bounded, time-ordered audit buffer. The oldest event is evicted once
/// `capacity` is reached.
#[derive(Debug)]
pub(crate) struct AuditLog {
    capacity: usize,
    events: VecDeque<ModerationAuditEvent>,
}

impl AuditLog {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    /// Append `event`. Returns the evicted event, if any.
    pub(crate) fn push(&mut self, event: ModerationAuditEvent) -> Option<ModerationAuditEvent> {
        let evicted = if self.events.len() == self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    /// Up to `limit` events, newest first.
    pub(crate) fn recent(&self, limit: usize) -> Vec<ModerationAuditEvent> {
        self.events.iter().rev().take(limit).cloned().collect()
    }

    /// Every buffered event for `subject`, oldest first.
    pub(crate) fn for_subject(&self, subject: SubjectId) -> Vec<ModerationAuditEvent> {
        self.events
            .iter()
            .filter(|event| event.subject == subject)
            .cloned()
            .collect()
    }

    /// Drop events stamped before `cutoff_ms`. Returns how many were dropped.
    pub(crate) fn prune_before(&mut self, cutoff_ms: u64) -> usize {
        let before = self.events.len();
        self.events.retain(|event| event.timestamp_ms >= cutoff_ms);
        before - self.events.len()
    }
}
