//! Error types for the classification provider seam.
//!
//! Detection outcomes are values, not errors: the sanitizer, spotlighter,
//! output validator, and both pipeline entry points are infallible. Only
//! the network call to the external classifier can fail, and the classifier
//! recovers from every variant here by failing open with a review flag.

use std::time::Duration;

/// Errors that can occur when calling the external classification provider.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// The HTTP request could not be completed.
    #[error("classification request failed ({provider}): {reason}")]
    RequestFailed { provider: String, reason: String },

    /// The provider rejected the credentials.
    #[error("classification auth failed ({provider})")]
    AuthFailed { provider: String },

    /// The provider rate-limited the call.
    #[error("classification rate limited ({provider})")]
    RateLimited { provider: String },

    /// The provider answered with something unusable.
    #[error("invalid classification response ({provider}): {reason}")]
    InvalidResponse { provider: String, reason: String },

    /// The call exceeded its hard latency budget.
    #[error("classification timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for provider calls.
pub type Result<T> = std::result::Result<T, ClassifierError>;
