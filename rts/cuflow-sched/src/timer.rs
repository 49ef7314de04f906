//! Deadline-ordered timer queue.

use crate::queue::Job;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

struct TimerEntry {
    deadline: Instant,
    /// Insertion order, so equal deadlines fire FIFO.
    seq: u64,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Jobs waiting for a deadline.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
}

impl TimerQueue {
    /// Insert a job. Returns true if it is now the earliest deadline.
    pub(crate) fn push(&mut self, deadline: Instant, job: Job) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        let earliest = self.next_deadline().map_or(true, |d| deadline < d);
        self.heap.push(Reverse(TimerEntry { deadline, seq, job }));
        earliest
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    /// Take the earliest job if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(Instant, Job)> {
        if self.next_deadline()? > now {
            return None;
        }
        self.heap.pop().map(|Reverse(e)| (e.deadline, e.job))
    }

    pub(crate) fn has_due(&self, now: Instant) -> bool {
        self.next_deadline().is_some_and(|d| d <= now)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
