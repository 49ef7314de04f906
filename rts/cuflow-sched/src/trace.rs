//! Scheduler event tracing.

use crate::flexq::FlexqId;
use crate::priority::Priority;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

/// Types of events that can be traced.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    /// A job was queued.
    JobScheduled {
        /// Queue the job landed in.
        flexq: FlexqId,
        /// Priority it was queued at.
        priority: Priority,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A job started running.
    JobStart {
        /// Queue the job came from.
        flexq: FlexqId,
        /// Worker ID, `None` when run by a yielding thread.
        worker_id: Option<usize>,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A job finished.
    JobComplete {
        /// Queue the job came from.
        flexq: FlexqId,
        /// Whether the job panicked.
        panicked: bool,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A flexq inherited a higher priority.
    PriorityRaised {
        /// The raised queue.
        flexq: FlexqId,
        /// Previous priority.
        from: Priority,
        /// New priority.
        to: Priority,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A timer job became due and was taken.
    TimerFired {
        /// When it was due.
        deadline: Instant,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A worker thread started.
    WorkerSpawn {
        /// Worker ID.
        worker_id: usize,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A worker thread retired.
    WorkerRetire {
        /// Worker ID.
        worker_id: usize,
        /// Timestamp.
        timestamp: Instant,
    },
}

/// Callback type for trace events.
pub type TraceCallback = Arc<dyn Fn(TraceEvent) + Send + Sync>;

static TRACE_CALLBACK: RwLock<Option<TraceCallback>> = RwLock::new(None);

/// Install the global trace callback, replacing any previous one.
///
/// Events are delivered on whichever thread caused them, with no scheduler
/// lock held, so the callback may itself queue work or swap the callback.
pub fn set_trace_callback(callback: impl Fn(TraceEvent) + Send + Sync + 'static) {
    *TRACE_CALLBACK.write() = Some(Arc::new(callback));
}

/// Clear the global trace callback.
pub fn clear_trace_callback() {
    *TRACE_CALLBACK.write() = None;
}

pub(crate) fn trace(event: TraceEvent) {
    let callback = TRACE_CALLBACK.read().clone();
    if let Some(callback) = callback {
        (callback.as_ref())(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callback_may_clear_itself() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        // other tests emit events concurrently; only count our own
        set_trace_callback(move |event| {
            if let TraceEvent::WorkerSpawn { worker_id: usize::MAX, .. } = event {
                counter.fetch_add(1, Ordering::SeqCst);
                clear_trace_callback();
            }
        });
        for _ in 0..2 {
            trace(TraceEvent::WorkerSpawn {
                worker_id: usize::MAX,
                timestamp: Instant::now(),
            });
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(TRACE_CALLBACK.read().is_none());
    }
}
