use thiserror::Error;

/// Error type for query operations.
///
/// Producers report failures with [`QueryError::FetchError`] or
/// [`QueryError::NetworkError`], and signal that they stopped because their
/// cancellation token fired with [`QueryError::Cancelled`]. The remaining variants
/// describe misuse and are returned directly from the call that caused them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The fetch was superseded or explicitly cancelled.
    ///
    /// Never stored on a record and never counted as a failure.
    #[error("Query was cancelled")]
    Cancelled,

    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    /// A record exists for the key but holds a different value type.
    #[error("Query {key} does not hold values of type {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("Invalid query key: {0}")]
    InvalidKey(String),

    /// A fetch was requested for a query registered without a producer.
    #[error("Query {0} has no producer")]
    MissingProducer(String),
}

impl QueryError {
    /// Returns `true` for [`QueryError::Cancelled`].
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` for errors raised by invalid use of the API rather than by a producer.
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::TypeMismatch { .. } | Self::InvalidKey(_) | Self::MissingProducer(_)
        )
    }
}
