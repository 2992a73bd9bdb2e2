//! Bounded priority run queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use uuid::Uuid;

use crate::error::SchedulerError;
use crate::task::Priority;

/// A queued task. Orders by priority, then by admission sequence (FIFO).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub priority: Priority,
    pub seq: u64,
    pub task_id: Uuid,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct RunQueue {
    heap: BinaryHeap<QueueEntry>,
    capacity: usize,
    next_seq: u64,
}

impl RunQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity,
            next_seq: 0,
        }
    }

    /// Reserve an admission sequence number, failing when the queue is full.
    pub fn reserve(&mut self) -> Result<u64, SchedulerError> {
        if self.heap.len() >= self.capacity {
            return Err(SchedulerError::QueueFull {
                capacity: self.capacity,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Insert an entry. Resumed tasks come back through here with their
    /// original sequence and are not subject to capacity.
    pub fn push(&mut self, entry: QueueEntry) {
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop()
    }

    /// Drop a task from the queue. Returns whether it was queued.
    pub fn remove(&mut self, task_id: Uuid) -> bool {
        let before = self.heap.len();
        self.heap.retain(|e| e.task_id != task_id);
        self.heap.len() != before
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
