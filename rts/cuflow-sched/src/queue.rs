//! The global work queue.
//!
//! A single mutex guards every priority bucket, every flexq and the timer
//! queue. Buckets and flexqs are nodes in one arena keyed by [`FlexqId`];
//! a node with pending work is linked into exactly one container (its
//! enclosing flexq or the bucket of its priority) so that a depth-first walk
//! from the buckets finds every runnable job.

use crate::flexq::{ambient, pop_ambient, push_ambient, FlexqId};
use crate::priority::{Priority, PRIORITY_LEVELS};
use crate::timer::TimerQueue;
use crate::trace::{trace, TraceEvent};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A hook probed by idle workers; returns true if it found work to do.
pub type SchedulerHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// Statistics for a work queue.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Jobs queued into buckets or flexqs.
    pub jobs_scheduled: u64,
    /// Jobs that ran to completion or panicked.
    pub jobs_run: u64,
    /// Jobs that panicked.
    pub jobs_failed: u64,
    /// Timer jobs taken after their deadline.
    pub timers_fired: u64,
    /// Flexq priority raises, including propagation to nested queues.
    pub priority_raises: u64,
    /// Worker threads started.
    pub workers_spawned: u64,
    /// Worker threads retired.
    pub workers_retired: u64,
}

// ============================================================================
// Arena
// ============================================================================

pub(crate) struct Node {
    pub(crate) priority: Priority,
    jobs: VecDeque<Job>,
    /// Linked nodes with pending work, served before `jobs`.
    subqueues: VecDeque<FlexqId>,
    /// Container this node is linked into while it has work.
    linked_in: Option<FlexqId>,
    /// Enclosing flexq, set while entered inside one.
    pub(crate) parent: Option<FlexqId>,
    children: Vec<FlexqId>,
    pub(crate) handles: usize,
    /// Threads currently inside the node, entered or running its job.
    pub(crate) entered: usize,
}

impl Node {
    fn new(priority: Priority) -> Self {
        Self {
            priority,
            jobs: VecDeque::new(),
            subqueues: VecDeque::new(),
            linked_in: None,
            parent: None,
            children: Vec::new(),
            handles: 0,
            entered: 0,
        }
    }

    fn has_work(&self) -> bool {
        !self.jobs.is_empty() || !self.subqueues.is_empty()
    }
}

/// Worker pool bookkeeping, guarded by the queue lock.
#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) target: usize,
    pub(crate) live: usize,
    pub(crate) next_worker: usize,
    pub(crate) retired: Vec<usize>,
    pub(crate) schedulers: Vec<SchedulerHook>,
}

pub(crate) struct QueueState {
    nodes: FxHashMap<FlexqId, Node>,
    watermark: Option<Priority>,
    pub(crate) run_now: VecDeque<Job>,
    pub(crate) timers: TimerQueue,
    pub(crate) pool: PoolState,
}

/// A priority change made while relinking, reported after the lock drops.
pub(crate) type Raise = (FlexqId, Priority, Priority);

impl QueueState {
    fn new() -> Self {
        let nodes = (0..PRIORITY_LEVELS)
            .map(|level| (FlexqId(level as u64), Node::new(Priority::saturating(level))))
            .collect();
        Self {
            nodes,
            watermark: None,
            run_now: VecDeque::new(),
            timers: TimerQueue::default(),
            pool: PoolState::default(),
        }
    }

    pub(crate) const fn bucket(priority: Priority) -> FlexqId {
        FlexqId(priority.level() as u64)
    }

    pub(crate) const fn is_bucket(id: FlexqId) -> bool {
        id.0 < PRIORITY_LEVELS as u64
    }

    pub(crate) fn node(&self, id: FlexqId) -> &Node {
        &self.nodes[&id]
    }

    fn node_mut(&mut self, id: FlexqId) -> &mut Node {
        self.nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("{id} is not registered"))
    }

    pub(crate) fn contains(&self, id: FlexqId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Flexq IDs are unique across queues; bucket IDs are shared.
    pub(crate) fn create(&mut self, priority: Priority) -> FlexqId {
        static NEXT_FLEXQ: AtomicU64 = AtomicU64::new(PRIORITY_LEVELS as u64);
        let id = FlexqId(NEXT_FLEXQ.fetch_add(1, Ordering::Relaxed));
        let mut node = Node::new(priority);
        node.handles = 1;
        self.nodes.insert(id, node);
        id
    }

    /// Bit `l` set when bucket `l` has work.
    fn occupied(&self) -> u8 {
        (0..PRIORITY_LEVELS).fold(0, |bits, level| {
            let has = self.node(FlexqId(level as u64)).has_work();
            bits | (u8::from(has) << level)
        })
    }

    fn refresh_watermark(&mut self) {
        let bits = self.occupied();
        self.watermark = (0..PRIORITY_LEVELS)
            .rev()
            .find(|&level| bits & (1 << level) != 0)
            .map(Priority::saturating);
    }

    pub(crate) fn watermark(&self) -> Option<Priority> {
        self.watermark
    }

    /// Make a node with work reachable from its bucket.
    fn link(&mut self, id: FlexqId) {
        let node = self.node(id);
        if Self::is_bucket(id) || node.linked_in.is_some() || !node.has_work() {
            return;
        }
        let target = match node.parent {
            Some(parent) if self.node(parent).priority == node.priority => parent,
            _ => Self::bucket(node.priority),
        };
        self.node_mut(target).subqueues.push_back(id);
        self.node_mut(id).linked_in = Some(target);
        self.link(target);
    }

    fn unlink(&mut self, id: FlexqId) {
        let Some(container) = self.node_mut(id).linked_in.take() else {
            return;
        };
        let holder = self.node_mut(container);
        holder.subqueues.retain(|&sub| sub != id);
        if !holder.has_work() {
            self.unlink(container);
            self.reap(container);
        }
    }

    /// Drop a flexq nobody can reach any more.
    pub(crate) fn reap(&mut self, id: FlexqId) {
        if Self::is_bucket(id) {
            return;
        }
        let node = self.node(id);
        let idle = node.handles == 0 && node.entered == 0;
        if !idle || node.has_work() || node.linked_in.is_some() {
            return;
        }
        if let Some(node) = self.nodes.remove(&id) {
            if let Some(parent) = node.parent {
                self.node_mut(parent).children.retain(|&c| c != id);
            }
            for child in node.children {
                self.node_mut(child).parent = None;
            }
            tracing::trace!(flexq = %id, "flexq reaped");
        }
    }

    /// Queue a job on a node. Returns true if a bucket went from empty to
    /// occupied.
    pub(crate) fn push_job(&mut self, id: FlexqId, job: Job) -> bool {
        let before = self.occupied();
        self.node_mut(id).jobs.push_back(job);
        self.link(id);
        self.refresh_watermark();
        self.occupied() & !before != 0
    }

    /// Take the next job at `cutoff` or above, highest bucket first.
    ///
    /// The queue the job came from counts as entered until
    /// [`QueueState::finish`] is called for it.
    pub(crate) fn pop_job(&mut self, cutoff: Priority) -> Option<(Job, FlexqId)> {
        let found = Priority::descending_to(cutoff).find_map(|p| self.pop_from(Self::bucket(p)));
        if found.is_some() {
            self.refresh_watermark();
        }
        found
    }

    /// Depth-first: nested flexqs before the node's own jobs.
    fn pop_from(&mut self, id: FlexqId) -> Option<(Job, FlexqId)> {
        while let Some(&sub) = self.node(id).subqueues.front() {
            let found = self.pop_from(sub);
            if !self.node(sub).has_work() {
                self.node_mut(id).subqueues.pop_front();
                self.node_mut(sub).linked_in = None;
                self.reap(sub);
            }
            if found.is_some() {
                return found;
            }
        }
        let node = self.node_mut(id);
        let job = node.jobs.pop_front()?;
        if !Self::is_bucket(id) {
            node.entered += 1;
        }
        Some((job, id))
    }

    /// Adjust the entry count of a flexq, reaping it once idle.
    pub(crate) fn entered(&mut self, id: FlexqId, delta: isize) {
        if Self::is_bucket(id) || !self.contains(id) {
            return;
        }
        let node = self.node_mut(id);
        node.entered = node.entered.saturating_add_signed(delta);
        self.reap(id);
    }

    /// Adjust the handle count of a flexq, reaping it once idle.
    pub(crate) fn handles(&mut self, id: FlexqId, delta: isize) {
        if !self.contains(id) {
            return;
        }
        let node = self.node_mut(id);
        node.handles = node.handles.saturating_add_signed(delta);
        self.reap(id);
    }

    /// Release a queue a job was taken from.
    pub(crate) fn finish(&mut self, id: FlexqId) {
        self.entered(id, -1);
    }

    fn is_ancestor(&self, candidate: FlexqId, of: FlexqId) -> bool {
        let mut cursor = Some(of);
        while let Some(id) = cursor {
            if id == candidate {
                return true;
            }
            cursor = self.node(id).parent;
        }
        false
    }

    /// Nest `child` inside `parent`, ignoring nestings that would form a
    /// cycle.
    pub(crate) fn attach(&mut self, child: FlexqId, parent: FlexqId) {
        if Self::is_bucket(parent) || self.is_ancestor(child, parent) {
            return;
        }
        if self.node(child).parent == Some(parent) {
            return;
        }
        self.detach(child);
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.push(child);
        self.relink(child);
    }

    /// Cut the nesting link; pending work moves to the child's own bucket.
    pub(crate) fn detach(&mut self, child: FlexqId) {
        let Some(parent) = self.node_mut(child).parent.take() else {
            return;
        };
        self.node_mut(parent).children.retain(|&c| c != child);
        self.relink(child);
    }

    fn relink(&mut self, id: FlexqId) {
        if self.node(id).linked_in.is_some() {
            self.unlink(id);
        }
        self.link(id);
        self.refresh_watermark();
    }

    /// Raise a node to at least `to`, propagating to nested queues.
    pub(crate) fn raise(&mut self, id: FlexqId, to: Priority, raised: &mut Vec<Raise>) {
        let from = self.node(id).priority;
        if Self::is_bucket(id) || to <= from {
            return;
        }
        self.node_mut(id).priority = to;
        raised.push((id, from, to));
        self.relink(id);
        for child in self.node(id).children.clone() {
            self.raise(child, to, raised);
        }
    }

    pub(crate) fn pending(&self, id: FlexqId) -> usize {
        let node = self.node(id);
        node.jobs.len() + node.subqueues.iter().map(|&s| self.pending(s)).sum::<usize>()
    }
}

// ============================================================================
// Work Queue
// ============================================================================

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) state: Mutex<QueueState>,
    /// Signalled when work, a timer or a pool change arrives.
    pub(crate) available: Condvar,
    /// Signalled when a worker retires.
    pub(crate) retired: Condvar,
    pub(crate) stats: RwLock<SchedulerStats>,
}

/// A priority work queue.
///
/// Cloning yields another handle to the same queue. Jobs are served from
/// the highest occupied bucket; within a bucket, nested flexqs go before the
/// bucket's own jobs and each list is FIFO.
#[derive(Clone)]
pub struct WorkQueue {
    pub(crate) shared: Arc<Shared>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("id", &self.shared.id)
            .field("watermark", &self.current_priority())
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        static NEXT_QUEUE: AtomicU64 = AtomicU64::new(0);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_QUEUE.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(QueueState::new()),
                available: Condvar::new(),
                retired: Condvar::new(),
                stats: RwLock::new(SchedulerStats::default()),
            }),
        }
    }

    /// Queue `job` on the bucket for `priority`.
    pub fn sched_at(&self, priority: Priority, job: impl FnOnce() + Send + 'static) {
        self.sched_on(QueueState::bucket(priority), Box::new(job));
    }

    /// Queue `job` at the calling thread's ambient position: the flexq it
    /// has entered or is running a job from, else the lowest bucket.
    pub fn sched(&self, job: impl FnOnce() + Send + 'static) {
        let target = ambient(self.shared.id).unwrap_or(QueueState::bucket(Priority::MIN));
        self.sched_on(target, Box::new(job));
    }

    pub(crate) fn sched_on(&self, target: FlexqId, job: Job) {
        let (woke, priority) = {
            let mut state = self.shared.state.lock();
            let woke = state.push_job(target, job);
            (woke, state.node(target).priority)
        };
        if woke {
            self.shared.available.notify_one();
        }
        self.shared.stats.write().jobs_scheduled += 1;
        trace(TraceEvent::JobScheduled {
            flexq: target,
            priority,
            timestamp: Instant::now(),
        });
    }

    /// Run one job at `cutoff` or above on the calling thread. Returns
    /// whether a job ran.
    pub fn yield_at(&self, cutoff: Priority) -> bool {
        let taken = self.shared.state.lock().pop_job(cutoff);
        match taken {
            Some((job, from)) => {
                self.run_job(job, from, None);
                true
            }
            None => false,
        }
    }

    /// Run one job at or above the ambient priority.
    pub fn yield_now(&self) -> bool {
        self.yield_at(self.ambient_priority())
    }

    /// Run jobs at `cutoff` or above until none is left. Returns how many
    /// ran.
    pub fn yield_all_at(&self, cutoff: Priority) -> usize {
        let mut ran = 0;
        while self.yield_at(cutoff) {
            ran += 1;
        }
        ran
    }

    /// Drain every bucket on the calling thread.
    pub fn yield_all(&self) -> usize {
        self.yield_all_at(Priority::MIN)
    }

    /// Highest bucket holding work, if any.
    #[must_use]
    pub fn current_priority(&self) -> Option<Priority> {
        self.shared.state.lock().watermark()
    }

    /// Priority of the flexq or bucket the calling thread is working in.
    #[must_use]
    pub fn ambient_priority(&self) -> Priority {
        match ambient(self.shared.id) {
            Some(id) => {
                let state = self.shared.state.lock();
                if state.contains(id) {
                    state.node(id).priority
                } else {
                    Priority::MIN
                }
            }
            None => Priority::MIN,
        }
    }

    /// Whether no bucket holds work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current_priority().is_none()
    }

    /// Jobs waiting in buckets and flexqs, excluding timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        let state = self.shared.state.lock();
        (0..PRIORITY_LEVELS)
            .map(|level| state.pending(FlexqId(level as u64)))
            .sum()
    }

    /// Run `job` on the next free worker, ahead of any bucket.
    pub fn call(&self, job: impl FnOnce() + Send + 'static) {
        self.shared.state.lock().run_now.push_back(Box::new(job));
        self.shared.available.notify_one();
    }

    /// Run `job` on a worker once `deadline` has passed.
    pub fn call_at(&self, deadline: Instant, job: impl FnOnce() + Send + 'static) {
        let earliest = self.shared.state.lock().timers.push(deadline, Box::new(job));
        if earliest {
            self.shared.available.notify_one();
        }
    }

    /// Run `job` on a worker after `delay`.
    pub fn call_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        self.call_at(Instant::now() + delay, job);
    }

    /// Run every due timer and run-now job on the calling thread. Returns
    /// how many ran.
    pub fn run_due(&self) -> usize {
        let mut ran = 0;
        let mut fired = None;
        loop {
            let next = {
                let mut state = self.shared.state.lock();
                match state.run_now.pop_front() {
                    Some(job) => Some(job),
                    None => state.timers.pop_due(Instant::now()).map(|(deadline, job)| {
                        fired = Some(deadline);
                        job
                    }),
                }
            };
            let Some(job) = next else {
                return ran;
            };
            if let Some(deadline) = fired.take() {
                self.timer_fired(deadline);
            }
            self.run_detached(job, None);
            ran += 1;
        }
    }

    /// Timer jobs still waiting for their deadline.
    #[must_use]
    pub fn timers_pending(&self) -> usize {
        self.shared.state.lock().timers.len()
    }

    /// Get queue statistics.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.read().clone()
    }

    pub(crate) fn timer_fired(&self, deadline: Instant) {
        self.shared.stats.write().timers_fired += 1;
        trace(TraceEvent::TimerFired {
            deadline,
            timestamp: Instant::now(),
        });
    }

    /// Run a job taken from `from`, with `from` as the ambient queue.
    pub(crate) fn run_job(&self, job: Job, from: FlexqId, worker_id: Option<usize>) {
        trace(TraceEvent::JobStart {
            flexq: from,
            worker_id,
            timestamp: Instant::now(),
        });
        push_ambient(self.shared.id, from);
        let outcome = panic::catch_unwind(AssertUnwindSafe(job));
        pop_ambient(self.shared.id, from);
        self.shared.state.lock().finish(from);
        self.settle(outcome, from);
    }

    /// Run a timer or run-now job, which belongs to no queue.
    pub(crate) fn run_detached(&self, job: Job, worker_id: Option<usize>) {
        let from = QueueState::bucket(Priority::MIN);
        trace(TraceEvent::JobStart {
            flexq: from,
            worker_id,
            timestamp: Instant::now(),
        });
        let outcome = panic::catch_unwind(AssertUnwindSafe(job));
        self.settle(outcome, from);
    }

    fn settle(&self, outcome: std::thread::Result<()>, from: FlexqId) {
        let panicked = outcome.is_err();
        {
            let mut stats = self.shared.stats.write();
            stats.jobs_run += 1;
            if panicked {
                stats.jobs_failed += 1;
            }
        }
        if let Err(payload) = outcome {
            tracing::warn!(flexq = %from, panic = %panic_message(&*payload), "job panicked");
        }
        trace(TraceEvent::JobComplete {
            flexq: from,
            panicked,
            timestamp: Instant::now(),
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}
