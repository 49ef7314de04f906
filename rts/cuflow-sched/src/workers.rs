//! Worker thread pool.
//!
//! Workers share the work queue's lock. An idle worker takes, in order:
//! a run-now job, a due timer, the highest-priority queued job, and finally
//! probes the registered schedulers before sleeping until the next timer
//! deadline or a wakeup.

use crate::error::{SchedError, SchedResult};
use crate::priority::Priority;
use crate::queue::{SchedulerHook, Shared, WorkQueue};
use crate::trace::{trace, TraceEvent};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stack size for worker threads.
    pub stack_size: usize,
    /// Thread name prefix; workers are named `{prefix}-{id}`.
    pub name_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stack_size: 2 * 1024 * 1024, // 2 MB
            name_prefix: String::from("cuflow-worker"),
        }
    }
}

/// Number of CPUs available to the process.
#[must_use]
pub fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// ID of the worker running on this thread, if any.
#[must_use]
pub fn current_worker() -> Option<usize> {
    CURRENT_WORKER.with(Cell::get)
}

// ============================================================================
// Pool
// ============================================================================

/// A pool of worker threads serving one [`WorkQueue`].
///
/// Use one pool per queue. Dropping the pool retires and joins every
/// worker; jobs still queued stay in the queue.
pub struct Workers {
    queue: WorkQueue,
    config: WorkerConfig,
    handles: Mutex<FxHashMap<usize, JoinHandle<()>>>,
}

impl Workers {
    /// Create an empty pool for `queue`. No thread starts until
    /// [`Workers::spawn`].
    #[must_use]
    pub fn new(queue: &WorkQueue, config: WorkerConfig) -> Self {
        Self {
            queue: queue.clone(),
            config,
            handles: Mutex::new(FxHashMap::default()),
        }
    }

    /// Create a pool with the default configuration.
    #[must_use]
    pub fn with_default_config(queue: &WorkQueue) -> Self {
        Self::new(queue, WorkerConfig::default())
    }

    /// The queue this pool serves.
    #[must_use]
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Start or retire workers until exactly `target` are live. Returns the
    /// live count.
    ///
    /// Shrinking waits for surplus workers to finish their current job,
    /// except when called from a worker, where it returns at once and the
    /// surplus retires in the background.
    pub fn spawn(&self, target: usize) -> SchedResult<usize> {
        let shared = &self.queue.shared;
        let mut handles = self.handles.lock();
        let mut state = shared.state.lock();
        state.pool.target = target;

        let mut started = Vec::new();
        while state.pool.live < target {
            let id = state.pool.next_worker;
            let queue = self.queue.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{id}", self.config.name_prefix))
                .stack_size(self.config.stack_size)
                .spawn(move || worker_loop(id, queue));
            match spawned {
                Ok(handle) => {
                    state.pool.next_worker += 1;
                    state.pool.live += 1;
                    handles.insert(id, handle);
                    started.push(id);
                }
                Err(err) => {
                    state.pool.target = state.pool.live;
                    drop(state);
                    tracing::error!(error = %err, "failed to spawn worker");
                    return Err(SchedError::Spawn(err));
                }
            }
        }

        if state.pool.live > target {
            shared.available.notify_all();
            if current_worker().is_none() {
                while state.pool.live > state.pool.target {
                    shared.retired.wait(&mut state);
                }
            }
        }
        let retired = std::mem::take(&mut state.pool.retired);
        let live = state.pool.live;
        drop(state);

        if !started.is_empty() {
            shared.stats.write().workers_spawned += started.len() as u64;
            tracing::debug!(started = started.len(), live, "workers started");
        }
        for worker_id in started {
            trace(TraceEvent::WorkerSpawn {
                worker_id,
                timestamp: Instant::now(),
            });
        }
        for id in retired {
            if let Some(handle) = handles.remove(&id) {
                if current_worker() != Some(id) {
                    let _ = handle.join();
                }
            }
        }
        Ok(live)
    }

    /// Grow the pool to at least `n` workers.
    pub fn spawn_at_least(&self, n: usize) -> SchedResult<usize> {
        let target = self.target().max(n);
        self.spawn(target)
    }

    /// Shrink the pool to at most `n` workers.
    pub fn spawn_at_most(&self, n: usize) -> SchedResult<usize> {
        let target = self.target().min(n);
        self.spawn(target)
    }

    /// Live worker count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.queue.shared.state.lock().pool.live
    }

    /// Requested worker count.
    #[must_use]
    pub fn target(&self) -> usize {
        self.queue.shared.state.lock().pool.target
    }

    /// Run `job` on the next free worker.
    pub fn call(&self, job: impl FnOnce() + Send + 'static) {
        self.queue.call(job);
    }

    /// Run `job` on a worker once `deadline` has passed.
    pub fn call_at(&self, deadline: Instant, job: impl FnOnce() + Send + 'static) {
        self.queue.call_at(deadline, job);
    }

    /// Run `job` on a worker after `delay`.
    pub fn call_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        self.queue.call_after(delay, job);
    }

    /// Register a hook idle workers probe before sleeping.
    ///
    /// The hook returns true if it did some work. A hook with new work
    /// for sleeping workers should call [`Workers::wake`].
    pub fn register_scheduler(&self, hook: impl Fn() -> bool + Send + Sync + 'static) {
        let hook: SchedulerHook = Arc::new(hook);
        self.queue.shared.state.lock().pool.schedulers.push(hook);
        self.queue.shared.available.notify_all();
    }

    /// Wake every sleeping worker.
    pub fn wake(&self) {
        self.queue.shared.available.notify_all();
    }

    /// Retire and join every worker.
    pub fn shutdown(self) {
        drop(self);
    }

    fn stop(&mut self) {
        let _ = self.spawn(0);
        let handles = std::mem::take(&mut *self.handles.lock());
        if current_worker().is_some() {
            return;
        }
        for (_, handle) in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers")
            .field("count", &self.count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn worker_loop(id: usize, queue: WorkQueue) {
    CURRENT_WORKER.with(|w| w.set(Some(id)));
    tracing::debug!(worker = id, "worker started");

    let shared: Arc<Shared> = Arc::clone(&queue.shared);
    let mut state = shared.state.lock();
    let mut probed = false;
    loop {
        if state.pool.live > state.pool.target {
            state.pool.live -= 1;
            state.pool.retired.push(id);
            shared.retired.notify_all();
            break;
        }

        if let Some(job) = state.run_now.pop_front() {
            MutexGuard::unlocked(&mut state, || queue.run_detached(job, Some(id)));
            continue;
        }

        let now = Instant::now();
        if let Some((deadline, job)) = state.timers.pop_due(now) {
            if state.timers.has_due(now) {
                // let another worker take the next one
                shared.available.notify_one();
            }
            MutexGuard::unlocked(&mut state, || {
                queue.timer_fired(deadline);
                queue.run_detached(job, Some(id));
            });
            continue;
        }

        if let Some((job, from)) = state.pop_job(Priority::MIN) {
            probed = false;
            MutexGuard::unlocked(&mut state, || queue.run_job(job, from, Some(id)));
            continue;
        }

        if !probed && !state.pool.schedulers.is_empty() {
            let hooks = state.pool.schedulers.clone();
            let found = MutexGuard::unlocked(&mut state, || probe(id, &hooks));
            probed = !found;
            continue;
        }

        probed = false;
        match state.timers.next_deadline() {
            Some(deadline) => {
                shared.available.wait_until(&mut state, deadline);
            }
            None => shared.available.wait(&mut state),
        }
    }
    drop(state);

    shared.stats.write().workers_retired += 1;
    trace(TraceEvent::WorkerRetire {
        worker_id: id,
        timestamp: Instant::now(),
    });
    tracing::debug!(worker = id, "worker retired");
    CURRENT_WORKER.with(|w| w.set(None));
}

fn probe(worker: usize, hooks: &[SchedulerHook]) -> bool {
    hooks.iter().any(|hook| {
        panic::catch_unwind(AssertUnwindSafe(|| (hook.as_ref())())).unwrap_or_else(|_| {
            tracing::warn!(worker, "registered scheduler panicked");
            false
        })
    })
}
