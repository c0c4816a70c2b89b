//! Error types for the worker pool

use thiserror::Error;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors returned synchronously to pool callers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool has been released
    #[error("this pool has been closed")]
    Closed,

    /// No worker available and the caller may not wait
    #[error("too many tasks blocked on submit or nonblocking is set")]
    Overload,

    /// Negative expiry in a pool config
    #[error("invalid expiry for pool")]
    InvalidPoolExpiry,

    /// Pre-allocation needs a bounded capacity
    #[error("can not set up a negative capacity under pre-alloc mode")]
    InvalidPreAllocSize,

    /// Workers still running when the release deadline passed
    #[error("operation timed out")]
    Timeout,

    /// `release_timeout` called on a closed pool
    #[error("pool already closed")]
    AlreadyClosed,
}
