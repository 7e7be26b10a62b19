//! Error types for the marketplace client.

use marketlet_core::{InstanceId, OfferId};
use thiserror::Error;

/// A result type using `MarketError`.
pub type Result<T> = std::result::Result<T, MarketError>;

/// Errors that can occur while talking to the marketplace.
#[derive(Debug, Clone, Error)]
pub enum MarketError {
    /// The request budget is exhausted, locally or as reported by the marketplace.
    #[error("rate limited by marketplace")]
    RateLimited,

    /// The marketplace could not be reached or answered with a server error.
    #[error("marketplace unavailable: {0}")]
    Unavailable(String),

    /// The offer was rented by someone else between search and launch.
    #[error("offer {0} is no longer available")]
    OfferUnavailable(OfferId),

    /// The instance does not exist (never created or already destroyed).
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// The bearer credential was rejected.
    #[error("marketplace rejected credentials")]
    Unauthorized,

    /// The marketplace rejected the request.
    #[error("marketplace rejected request ({status}): {message}")]
    Rejected {
        /// HTTP status code returned.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// The response body could not be understood.
    #[error("invalid marketplace response: {0}")]
    InvalidResponse(String),

    /// Client configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MarketError {
    /// Check if this error is transient and worth retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable(_))
    }

    /// Build the error for a transport-level failure.
    pub(crate) fn transport(op: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Unavailable(format!("{op} timed out"))
        } else {
            Self::Unavailable(format!("{op} failed: {err}"))
        }
    }
}
