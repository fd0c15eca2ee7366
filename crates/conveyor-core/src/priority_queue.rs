//! Priority-ordered queue of job contexts
//!
//! A binary heap ordered by (priority desc, enqueue time asc). Jobs of equal
//! priority are delivered FIFO.

use crate::context::JobContext;
use crate::job::JobPriority;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Ordering wrapper around a job context.
#[derive(Debug, Clone)]
pub struct PrioritizedJob {
    /// Selection priority
    pub priority: JobPriority,

    /// Enqueue instant, breaks ties within a priority level
    pub queued_at: DateTime<Utc>,

    /// Insertion sequence, breaks ties between identical instants
    seq: u64,

    /// The wrapped context
    pub context: JobContext,
}

impl PartialEq for PrioritizedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.queued_at == other.queued_at && self.seq == other.seq
    }
}

impl Eq for PrioritizedJob {}

impl PartialOrd for PrioritizedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedJob {
    // Max-heap order: higher priority first, then earlier enqueue.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Binary-heap queue with priority-then-FIFO semantics.
///
/// `add` and `remove_first` are O(log n); `peek` is O(1);
/// `to_sorted_list` is O(n log n).
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<PrioritizedJob>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Insert a context with the given priority.
    pub fn add(&mut self, context: JobContext) {
        let entry = PrioritizedJob {
            priority: context.priority,
            queued_at: context.queued_at,
            seq: self.next_seq,
            context,
        };
        self.next_seq += 1;
        self.heap.push(entry);
    }

    /// Re-insert a previously removed entry, preserving its original ordering.
    pub fn add_entry(&mut self, entry: PrioritizedJob) {
        self.heap.push(entry);
    }

    /// Remove and return the highest-priority, oldest entry.
    pub fn remove_first(&mut self) -> Option<PrioritizedJob> {
        self.heap.pop()
    }

    /// Inspect the next entry without removing it.
    pub fn peek(&self) -> Option<&PrioritizedJob> {
        self.heap.peek()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Sorted copy of the queue contents (priority desc, FIFO within level).
    pub fn to_sorted_list(&self) -> Vec<PrioritizedJob> {
        let mut entries: Vec<_> = self.heap.iter().cloned().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueResult;
    use crate::job::{EnqueueOptions, Job};
    use serde_json::{Map, Value};
    use std::sync::Arc;

    #[derive(Debug)]
    struct NoopJob;

    #[async_trait::async_trait]
    impl Job for NoopJob {
        fn job_type(&self) -> &str {
            "noop"
        }

        async fn handle(&self) -> QueueResult<()> {
            Ok(())
        }

        fn to_map(&self) -> Map<String, Value> {
            Map::new()
        }
    }

    fn context_with(priority: JobPriority) -> JobContext {
        JobContext::new(
            Arc::new(NoopJob),
            &EnqueueOptions::new().with_priority(priority),
        )
    }

    #[test]
    fn test_priority_order() {
        let mut queue = PriorityQueue::new();
        queue.add(context_with(JobPriority::Low));
        queue.add(context_with(JobPriority::Critical));
        queue.add(context_with(JobPriority::High));

        assert_eq!(queue.len(), 3);
        assert_eq!(
            queue.remove_first().unwrap().priority,
            JobPriority::Critical
        );
        assert_eq!(queue.remove_first().unwrap().priority, JobPriority::High);
        assert_eq!(queue.remove_first().unwrap().priority, JobPriority::Low);
        assert!(queue.remove_first().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = PriorityQueue::new();
        let first = context_with(JobPriority::Normal);
        let second = context_with(JobPriority::Normal);
        let first_id = first.id.clone();
        let second_id = second.id.clone();

        queue.add(first);
        queue.add(second);

        assert_eq!(queue.remove_first().unwrap().context.id, first_id);
        assert_eq!(queue.remove_first().unwrap().context.id, second_id);
    }

    #[test]
    fn test_remove_on_empty_is_none() {
        let mut queue = PriorityQueue::new();
        assert!(queue.remove_first().is_none());
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut queue = PriorityQueue::new();
        queue.add(context_with(JobPriority::High));
        assert_eq!(queue.peek().unwrap().priority, JobPriority::High);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_to_sorted_list() {
        let mut queue = PriorityQueue::new();
        queue.add(context_with(JobPriority::Normal));
        queue.add(context_with(JobPriority::Critical));
        queue.add(context_with(JobPriority::Low));
        queue.add(context_with(JobPriority::High));

        let sorted = queue.to_sorted_list();
        let priorities: Vec<_> = sorted.iter().map(|e| e.priority).collect();
        assert_eq!(
            priorities,
            vec![
                JobPriority::Critical,
                JobPriority::High,
                JobPriority::Normal,
                JobPriority::Low,
            ]
        );
        // The queue itself is untouched
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_clear() {
        let mut queue = PriorityQueue::new();
        queue.add(context_with(JobPriority::Normal));
        queue.clear();
        assert!(queue.is_empty());
    }
}
