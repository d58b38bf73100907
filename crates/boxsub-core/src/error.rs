//! Error Types

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique external id already has a row
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Another writer held the key for longer than the lock timeout
    #[error("Lock timeout on key: {0}")]
    LockTimeout(String),

    /// Row referenced by a change does not exist
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Row is still referenced and cannot be removed
    #[error("Record is referenced: {0}")]
    Referenced(String),

    /// Backing storage is unavailable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Failure raised by a test fail point
    #[error("Injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    /// Check if a fresh attempt could succeed
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UniqueViolation(_) | Self::LockTimeout(_) | Self::Unavailable(_)
        )
    }
}
