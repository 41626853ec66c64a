//! Deferred requeue timer
//!
//! Threadlets that used up their timeslice but not their yield interval sit
//! here until their deadline. The scheduler fires due entries at the start of
//! every tick, and when nothing else is ready it parks the clock until the
//! earliest deadline instead of spinning.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

/// Entry in the timer heap
struct DeferredEntry<T> {
    /// When to requeue
    deadline: Duration,
    /// Insertion order, so equal deadlines fire FIFO
    seq: u64,
    item: T,
}

// Reverse ordering for min-heap (earliest deadline first)
impl<T> Ord for DeferredEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for DeferredEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for DeferredEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for DeferredEntry<T> {}

/// One-shot deferred callbacks keyed by deadline
pub(crate) struct DeferredQueue<T> {
    heap: BinaryHeap<DeferredEntry<T>>,
    next_seq: u64,
}

impl<T> DeferredQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Register `item` to fire at `deadline`
    pub(crate) fn push(&mut self, deadline: Duration, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(DeferredEntry {
            deadline,
            seq,
            item,
        });
    }

    /// Remove and return every entry due at `now`, earliest first
    pub(crate) fn pop_due(&mut self, now: Duration) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                due.push(entry.item);
            }
        }
        due
    }

    /// Earliest pending deadline
    pub(crate) fn next_deadline(&self) -> Option<Duration> {
        self.heap.peek().map(|e| e.deadline)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Remove every entry regardless of deadline
    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.heap.drain().map(|e| e.item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut t = DeferredQueue::new();
        t.push(ms(30), "c");
        t.push(ms(10), "a");
        t.push(ms(20), "b");
        assert_eq!(t.next_deadline(), Some(ms(10)));
        assert_eq!(t.pop_due(ms(5)), Vec::<&str>::new());
        assert_eq!(t.pop_due(ms(20)), vec!["a", "b"]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.pop_due(ms(100)), vec!["c"]);
        assert_eq!(t.next_deadline(), None);
    }

    #[test]
    fn test_equal_deadlines_fire_fifo() {
        let mut t = DeferredQueue::new();
        for name in ["x", "y", "z"] {
            t.push(ms(1), name);
        }
        assert_eq!(t.pop_due(ms(1)), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_drain() {
        let mut t = DeferredQueue::new();
        t.push(ms(1), 1);
        t.push(ms(2), 2);
        let mut all = t.drain();
        all.sort();
        assert_eq!(all, vec![1, 2]);
        assert_eq!(t.len(), 0);
    }
}
