//! Cache error types.

use thiserror::Error;

/// Errors from scheduling cache operations. All are recoverable by the
/// caller; none indicate a corrupted cache.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("task already assumed: {0}")]
    AlreadyAssumed(String),

    #[error("task already added: {0}")]
    AlreadyAdded(String),

    #[error("task not found in cache: {0}")]
    NotFound(String),

    #[error("binding already confirmed for task: {0}")]
    BindInProgress(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
