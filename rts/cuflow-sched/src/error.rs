//! Scheduler errors.

use thiserror::Error;

/// Result alias for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors reported by the scheduler.
#[derive(Debug, Error)]
pub enum SchedError {
    /// A priority outside `0..PRIORITY_LEVELS`.
    #[error("priority {level} out of range (0..{levels})")]
    InvalidPriority {
        /// Requested level.
        level: usize,
        /// Number of supported levels.
        levels: usize,
    },
    /// The OS refused to create a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
