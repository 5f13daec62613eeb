use std::collections::VecDeque;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::types::{Origin, QueueEntry};

/// The single running slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveExecution {
    pub job_id: String,
    pub origin: Origin,
    pub started_at: NaiveDateTime,
    /// Ledger row id; set once the row has been written.
    pub execution_id: Option<i64>,
}

/// What an enqueue request did to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueResult {
    /// A new entry was added.
    Enqueued,
    /// An existing scheduled entry was turned into a manual one and moved ahead.
    Promoted,
    /// The job already had an entry; nothing changed.
    AlreadyQueued,
    /// The job occupies the running slot; nothing changed.
    AlreadyRunning,
}

/// Ordered, de-duplicated pending requests plus the single-concurrency gate.
///
/// Layout is always `[manual entries..., scheduled entries...]`, each group in
/// insertion order. A job appears at most once across the entries and the
/// running slot.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    entries: VecDeque<QueueEntry>,
    active: Option<ActiveExecution>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request from the due scan.
    pub fn enqueue_scheduled(&mut self, job_id: &str, now: NaiveDateTime) -> EnqueueResult {
        if self.is_active(job_id) {
            return EnqueueResult::AlreadyRunning;
        }
        if self.position(job_id).is_some() {
            return EnqueueResult::AlreadyQueued;
        }
        self.entries.push_back(QueueEntry {
            job_id: job_id.to_string(),
            origin: Origin::Scheduled,
            enqueued_at: now,
        });
        EnqueueResult::Enqueued
    }

    /// Put an on-demand request ahead of every scheduled entry.
    ///
    /// Manual entries keep FIFO order among themselves.
    pub fn enqueue_manual(&mut self, job_id: &str, now: NaiveDateTime) -> EnqueueResult {
        if self.is_active(job_id) {
            return EnqueueResult::AlreadyRunning;
        }
        let result = match self.position(job_id) {
            Some(idx) if self.entries[idx].origin == Origin::Manual => {
                return EnqueueResult::AlreadyQueued;
            }
            Some(idx) => {
                self.entries.remove(idx);
                EnqueueResult::Promoted
            }
            None => EnqueueResult::Enqueued,
        };
        let at = self
            .entries
            .iter()
            .take_while(|e| e.origin == Origin::Manual)
            .count();
        self.entries.insert(
            at,
            QueueEntry {
                job_id: job_id.to_string(),
                origin: Origin::Manual,
                enqueued_at: now,
            },
        );
        result
    }

    /// Take the front entry into the running slot.
    ///
    /// Returns `None` when the queue is empty or the slot is occupied.
    pub(crate) fn dequeue(&mut self, now: NaiveDateTime) -> Option<QueueEntry> {
        if self.active.is_some() {
            return None;
        }
        let entry = self.entries.pop_front()?;
        self.active = Some(ActiveExecution {
            job_id: entry.job_id.clone(),
            origin: entry.origin,
            started_at: now,
            execution_id: None,
        });
        Some(entry)
    }

    pub(crate) fn mark_started(&mut self, execution_id: i64) {
        if let Some(active) = self.active.as_mut() {
            active.execution_id = Some(execution_id);
        }
    }

    /// Free the running slot.
    pub(crate) fn finish(&mut self) -> Option<ActiveExecution> {
        self.active.take()
    }

    /// Undo a dequeue whose execution never started.
    pub(crate) fn restore(&mut self, entry: QueueEntry) {
        self.active = None;
        if self.position(&entry.job_id).is_none() {
            self.entries.push_front(entry);
        }
    }

    /// Drop the queued entry for `job_id`, if any.
    pub fn remove(&mut self, job_id: &str) -> Option<QueueEntry> {
        let idx = self.position(job_id)?;
        self.entries.remove(idx)
    }

    pub fn active(&self) -> Option<&ActiveExecution> {
        self.active.as_ref()
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active.as_ref().is_some_and(|a| a.job_id == job_id)
    }

    /// Snapshot of the pending entries, front first.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, job_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.job_id == job_id)
    }
}
