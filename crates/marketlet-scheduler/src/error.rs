//! Error types for the scheduler crate.

use thiserror::Error;

/// Errors that can occur while ranking offers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    /// No offer passed the hard constraints.
    #[error("no matching offers ({considered} considered)")]
    NoMatchingOffers {
        /// Number of offers that were filtered.
        considered: usize,
    },

    /// The scheduling configuration is inconsistent.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

impl ScheduleError {
    /// Scheduling errors are terminal for the attempt that produced them.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        false
    }
}

/// A specialized Result type for scheduling operations.
pub type Result<T> = std::result::Result<T, ScheduleError>;
