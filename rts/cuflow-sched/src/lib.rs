//! Priority scheduler for the cuflow runtime.
//!
//! This crate provides a shared work queue and the threads that serve it:
//!
//! - **Priority buckets** - [`WorkQueue`] keeps a FIFO of jobs per
//!   [`Priority`] level and always serves the highest occupied level
//! - **Flexqs** - [`Flexq`] is a queue with its own priority that can be
//!   nested inside another one, inheriting its priority
//! - **Cooperative yielding** - any thread may run queued work at or above
//!   a cutoff with [`WorkQueue::yield_at`]
//! - **Worker pool** - [`Workers`] runs jobs, timers and registered
//!   schedulers on background threads
//! - **Event tracing** - hooks for observability
//!
//! # Priority inheritance
//!
//! ```
//! use cuflow_sched::{Flexq, Priority, WorkQueue};
//!
//! let queue = WorkQueue::new();
//! let outer = Flexq::new(&queue, Priority::saturating(5));
//! let inner = Flexq::new(&queue, Priority::MIN);
//!
//! let _outer = outer.enter_scoped();
//! let _inner = inner.enter_scoped();
//! inner.sched(|| ());
//! assert_eq!(inner.priority(), Priority::saturating(5));
//! assert!(queue.yield_at(Priority::saturating(5)));
//! ```
//!
//! # Worker loop
//!
//! ```text
//!            +-----------+
//!   wake --> | run-now   | --> due timer --> highest bucket --> probe hooks
//!            +-----------+                                         |
//!                 ^                                                v
//!                 +------------- sleep until next deadline <-------+
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod error;
mod flexq;
mod priority;
mod queue;
mod timer;
mod trace;
mod workers;

pub use error::{SchedError, SchedResult};
pub use flexq::{Flexq, FlexqGuard, FlexqId};
pub use priority::{Priority, PRIORITY_LEVELS};
pub use queue::{Job, SchedulerHook, SchedulerStats, WorkQueue};
pub use trace::{clear_trace_callback, set_trace_callback, TraceCallback, TraceEvent};
pub use workers::{current_worker, num_cpus, WorkerConfig, Workers};
