//! The cuflow runtime.
//!
//! Three layers, usable separately or bundled by [`Runtime`]:
//!
//! - [`flow`] - single-threaded continuations, choice points, dynamic wind
//!   and exceptions
//! - [`sched`] - priority work queues, flexqs and the worker pool
//! - [`cache`] - the decaying cache, ticked by the pool's timers
//!
//! ```
//! use cuflow::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig {
//!     workers: 2,
//!     ..Default::default()
//! })
//! .unwrap();
//! let (tx, rx) = std::sync::mpsc::channel();
//! runtime.queue().sched(move || {
//!     let pairs = cuflow::solutions(|| (cuflow::split(2), cuflow::split(2)));
//!     tx.send(pairs.len()).unwrap();
//! });
//! assert_eq!(rx.recv().unwrap(), 4);
//! runtime.shutdown();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod runtime;

pub use cuflow_cache as cache;
pub use cuflow_flow as flow;
pub use cuflow_sched as sched;

pub use cuflow_cache::{Built, Cache, CacheConf, CacheConfig, CacheError, CacheObject};
pub use cuflow_flow::{
    call_in_root, call_with_cc, catch, dynamic_wind, explore, fail, solutions, split, throw,
    Captured, Continuation, Exception, FlowMode,
};
pub use cuflow_sched::{Flexq, Priority, SchedError, WorkQueue, WorkerConfig, Workers};
pub use runtime::{Runtime, RuntimeConfig, RuntimeError, RuntimeResult};
