//! Flexible queues with priority inheritance.
//!
//! A flexq is a FIFO of jobs with its own priority, served through the
//! bucket of that priority. Entering a flexq while already working inside
//! another one nests it there: the inner queue inherits the outer queue's
//! priority if that is higher, and its jobs are served through the outer
//! queue for as long as the two priorities agree. Raising a flexq raises
//! every queue nested in it.

use crate::priority::Priority;
use crate::queue::{QueueState, Raise, WorkQueue};
use crate::trace::{trace, TraceEvent};
use std::cell::RefCell;
use std::fmt;
use std::time::Instant;

/// Identifier of a flexq or priority bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlexqId(pub(crate) u64);

impl FlexqId {
    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlexqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if QueueState::is_bucket(*self) {
            write!(f, "Bucket({})", self.0)
        } else {
            write!(f, "Flexq({})", self.0)
        }
    }
}

// ============================================================================
// Ambient position
// ============================================================================

thread_local! {
    /// Queues this thread is inside, innermost last, tagged by work queue.
    static AMBIENT: RefCell<Vec<(u64, FlexqId)>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn ambient(queue: u64) -> Option<FlexqId> {
    AMBIENT.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|(q, _)| *q == queue)
            .map(|&(_, id)| id)
    })
}

pub(crate) fn push_ambient(queue: u64, id: FlexqId) {
    AMBIENT.with(|stack| stack.borrow_mut().push((queue, id)));
}

pub(crate) fn pop_ambient(queue: u64, id: FlexqId) {
    AMBIENT.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(pos) = stack.iter().rposition(|&entry| entry == (queue, id)) {
            stack.remove(pos);
        }
    });
}

// ============================================================================
// Flexq
// ============================================================================

/// A handle to a flexq on a [`WorkQueue`].
///
/// Cloning yields another handle to the same flexq. The flexq lives until
/// its last handle is dropped and its pending jobs have run.
pub struct Flexq {
    queue: WorkQueue,
    id: FlexqId,
}

impl Flexq {
    /// Create an empty flexq at `priority`.
    #[must_use]
    pub fn new(queue: &WorkQueue, priority: Priority) -> Self {
        let id = queue.shared.state.lock().create(priority);
        tracing::trace!(flexq = %id, %priority, "flexq created");
        Self {
            queue: queue.clone(),
            id,
        }
    }

    /// The flexq's identifier.
    #[must_use]
    pub const fn id(&self) -> FlexqId {
        self.id
    }

    /// Current priority, including any inherited raise.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.queue.shared.state.lock().node(self.id).priority
    }

    /// The flexq this one is nested in, if any.
    #[must_use]
    pub fn parent(&self) -> Option<FlexqId> {
        self.queue.shared.state.lock().node(self.id).parent
    }

    /// Jobs waiting in this flexq and the queues nested in it.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.shared.state.lock().pending(self.id)
    }

    /// Queue `job` on this flexq.
    pub fn sched(&self, job: impl FnOnce() + Send + 'static) {
        self.queue.sched_on(self.id, Box::new(job));
    }

    /// Make this flexq the calling thread's ambient queue.
    ///
    /// If the thread was already inside another flexq of the same work
    /// queue, this one is nested there and inherits its priority when that
    /// is higher. Must be balanced by [`Flexq::leave`].
    pub fn enter(&self) {
        let outer = ambient(self.queue.shared.id);
        let mut raised = Vec::new();
        {
            let mut state = self.queue.shared.state.lock();
            state.entered(self.id, 1);
            let outer = outer.filter(|&o| o != self.id && state.contains(o));
            if let Some(outer) = outer {
                let inherited = state.node(outer).priority;
                state.attach(self.id, outer);
                state.raise(self.id, inherited, &mut raised);
            }
        }
        push_ambient(self.queue.shared.id, self.id);
        self.report(&raised);
    }

    /// Leave this flexq, cutting its nesting link. Pending jobs stay queued
    /// in the bucket of the flexq's priority.
    pub fn leave(&self) {
        pop_ambient(self.queue.shared.id, self.id);
        let mut state = self.queue.shared.state.lock();
        state.detach(self.id);
        state.entered(self.id, -1);
    }

    /// [`Flexq::enter`] for the lifetime of the returned guard.
    #[must_use = "the flexq is left when the guard drops"]
    pub fn enter_scoped(&self) -> FlexqGuard<'_> {
        self.enter();
        FlexqGuard { flexq: self }
    }

    /// Raise this flexq and every queue nested in it to at least `to`.
    pub fn raise_priority(&self, to: Priority) {
        let mut raised = Vec::new();
        self.queue.shared.state.lock().raise(self.id, to, &mut raised);
        self.report(&raised);
    }

    fn report(&self, raised: &[Raise]) {
        if raised.is_empty() {
            return;
        }
        self.queue.shared.stats.write().priority_raises += raised.len() as u64;
        if raised.iter().any(|&(id, ..)| id == self.id) {
            // relinking may have exposed work in a higher bucket
            self.queue.shared.available.notify_one();
        }
        for &(flexq, from, to) in raised {
            tracing::debug!(%flexq, %from, %to, "priority raised");
            trace(TraceEvent::PriorityRaised {
                flexq,
                from,
                to,
                timestamp: Instant::now(),
            });
        }
    }
}

impl Clone for Flexq {
    fn clone(&self) -> Self {
        let mut state = self.queue.shared.state.lock();
        state.handles(self.id, 1);
        Self {
            queue: self.queue.clone(),
            id: self.id,
        }
    }
}

impl Drop for Flexq {
    fn drop(&mut self) {
        let mut state = self.queue.shared.state.lock();
        state.handles(self.id, -1);
    }
}

impl fmt::Debug for Flexq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flexq").field("id", &self.id).finish()
    }
}

/// Leaves its flexq when dropped.
#[derive(Debug)]
pub struct FlexqGuard<'a> {
    flexq: &'a Flexq,
}

impl Drop for FlexqGuard<'_> {
    fn drop(&mut self) {
        self.flexq.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn p(level: usize) -> Priority {
        Priority::saturating(level)
    }

    #[test]
    fn test_flexq_jobs_are_fifo() {
        let queue = WorkQueue::new();
        let fq = Flexq::new(&queue, p(2));
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4 {
            let log = Arc::clone(&log);
            fq.sched(move || log.lock().unwrap().push(tag));
        }
        assert_eq!(fq.pending(), 4);
        assert_eq!(queue.current_priority(), Some(p(2)));
        queue.yield_all();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(fq.pending(), 0);
    }

    #[test]
    fn test_flexq_before_bucket_jobs() {
        let queue = WorkQueue::new();
        let fq = Flexq::new(&queue, p(3));
        let log = Arc::new(Mutex::new(Vec::new()));
        let direct = Arc::clone(&log);
        queue.sched_at(p(3), move || direct.lock().unwrap().push("bucket"));
        let nested = Arc::clone(&log);
        fq.sched(move || nested.lock().unwrap().push("flexq"));
        queue.yield_all();
        assert_eq!(*log.lock().unwrap(), vec!["flexq", "bucket"]);
    }

    #[test]
    fn test_enter_inherits_outer_priority() {
        let queue = WorkQueue::new();
        let outer = Flexq::new(&queue, p(5));
        let inner = Flexq::new(&queue, p(0));
        {
            let _outer = outer.enter_scoped();
            let _inner = inner.enter_scoped();
            assert_eq!(inner.priority(), p(5));
            assert_eq!(inner.parent(), Some(outer.id()));
        }
        assert_eq!(inner.parent(), None);
        assert_eq!(inner.priority(), p(5));
    }

    #[test]
    fn test_enter_never_lowers_priority() {
        let queue = WorkQueue::new();
        let outer = Flexq::new(&queue, p(1));
        let inner = Flexq::new(&queue, p(6));
        let _outer = outer.enter_scoped();
        let _inner = inner.enter_scoped();
        assert_eq!(inner.priority(), p(6));
    }

    #[test]
    fn test_raise_propagates_to_nested() {
        let queue = WorkQueue::new();
        let outer = Flexq::new(&queue, p(2));
        let inner = Flexq::new(&queue, p(2));
        let _outer = outer.enter_scoped();
        let _inner = inner.enter_scoped();
        outer.raise_priority(p(6));
        assert_eq!(outer.priority(), p(6));
        assert_eq!(inner.priority(), p(6));
        assert_eq!(queue.stats().priority_raises, 2);
    }

    #[test]
    fn test_raise_moves_pending_work() {
        let queue = WorkQueue::new();
        let fq = Flexq::new(&queue, p(1));
        fq.sched(|| ());
        assert_eq!(queue.current_priority(), Some(p(1)));
        fq.raise_priority(p(4));
        assert_eq!(queue.current_priority(), Some(p(4)));
        assert!(!queue.yield_at(p(5)));
        assert!(queue.yield_at(p(4)));
    }

    #[test]
    fn test_nested_work_served_through_outer() {
        let queue = WorkQueue::new();
        let outer = Flexq::new(&queue, p(3));
        let inner = Flexq::new(&queue, p(3));
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let _outer = outer.enter_scoped();
            let _inner = inner.enter_scoped();
            let l = Arc::clone(&log);
            inner.sched(move || l.lock().unwrap().push("inner"));
            let l = Arc::clone(&log);
            outer.sched(move || l.lock().unwrap().push("outer"));
            assert_eq!(outer.pending(), 2);
            assert_eq!(queue.yield_all(), 2);
        }
        assert_eq!(*log.lock().unwrap(), vec!["inner", "outer"]);
    }

    #[test]
    fn test_dropped_flexq_still_runs_pending() {
        let queue = WorkQueue::new();
        let ran = Arc::new(Mutex::new(false));
        {
            let fq = Flexq::new(&queue, p(2));
            let ran = Arc::clone(&ran);
            fq.sched(move || *ran.lock().unwrap() = true);
        }
        assert_eq!(queue.pending(), 1);
        queue.yield_all();
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_reentering_ancestor_does_not_cycle() {
        let queue = WorkQueue::new();
        let a = Flexq::new(&queue, p(2));
        let b = Flexq::new(&queue, p(2));
        a.enter();
        b.enter();
        a.enter();
        a.sched(|| ());
        assert_eq!(queue.yield_all(), 1);
        a.leave();
        b.leave();
        a.leave();
    }
}
