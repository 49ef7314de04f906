//! Cache errors.

use thiserror::Error;

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors reported by the cache.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// No constructor is registered under this function code.
    #[error("no constructor registered for `{code}`")]
    UnknownCode {
        /// The function code looked up.
        code: &'static str,
    },
    /// A configuration value is out of range.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}
