//! Payment Error Types

use boxsub_core::StoreError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
///
/// The variants follow how a failure should be handled rather than where it
/// came from: rejected, dropped, treated as a no-op, retried, or logged.
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Missing or invalid webhook signature
    #[error("Webhook authentication failed: {0}")]
    Authentication(String),

    /// Missing metadata, unknown user, foreign address
    #[error("Validation error: {0}")]
    Validation(String),

    /// Event already reconciled
    #[error("Duplicate event: {0}")]
    Conflict(String),

    /// Gateway unavailable or rate limited
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Gateway call exceeded its deadline
    #[error("Gateway timeout: {0}")]
    Timeout(String),

    /// Gateway rejected the request
    #[error("Stripe error: {0}")]
    Gateway(String),

    /// Schema mismatch or broken invariant
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Payload parsing failed
    #[error("Webhook parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PaymentError {
    /// Check if this error is retryable
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout(_) => true,
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get user-friendly message
    pub const fn user_message(&self) -> &str {
        match self {
            Self::Transient(_) | Self::Timeout(_) | Self::Gateway(_) => {
                "There was a problem connecting to the payment service. Please try again shortly."
            }
            Self::Validation(_) => {
                "Some checkout details are no longer valid. Please check them and try again."
            }
            Self::Config(_) => "Service configuration error.",
            _ => "An error occurred processing your request.",
        }
    }
}
