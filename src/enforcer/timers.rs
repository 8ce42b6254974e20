//! Deadline queue driving the enforcer loop's delayed work.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

struct Entry<T> {
    at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// Items come out in deadline order; equal deadlines keep insertion order.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { at, seq, item }));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.at)
    }

    /// Remove and return the earliest item due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.at <= now => {
                self.heap.pop().map(|Reverse(entry)| entry.item)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pops_in_deadline_order() {
        let start = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(start + Duration::from_millis(30), "c");
        timers.schedule(start + Duration::from_millis(10), "a");
        timers.schedule(start + Duration::from_millis(20), "b");

        let later = start + Duration::from_millis(50);
        assert_eq!(timers.pop_due(later), Some("a"));
        assert_eq!(timers.pop_due(later), Some("b"));
        assert_eq!(timers.pop_due(later), Some("c"));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_nothing_due_before_deadline() {
        let start = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(start + Duration::from_secs(5), 1);

        assert_eq!(timers.pop_due(start), None);
        assert_eq!(timers.next_deadline(), Some(start + Duration::from_secs(5)));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_equal_deadlines_keep_insertion_order() {
        let at = Instant::now();
        let mut timers = TimerQueue::new();
        for i in 0..5 {
            timers.schedule(at, i);
        }
        let popped: Vec<_> = std::iter::from_fn(|| timers.pop_due(at)).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }
}
