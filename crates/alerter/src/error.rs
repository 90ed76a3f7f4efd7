//! Error types raised by alerters.

use thiserror::Error;

/// Errors an alerter can raise while executing an operation.
///
/// The dispatch core only cares about one distinction: whether the failure is
/// worth another attempt. See [`AlerterError::is_retryable`].
#[derive(Debug, Error)]
pub enum AlerterError {
    /// The alerter explicitly asked for a retry
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// Could not reach the remote system
    #[error("connection failed: {0}")]
    Connection(String),

    /// The remote system did not answer in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Rate limited by the remote system
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The remote system refused the request
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// The alerter does not implement this operation
    #[error("operation not supported by {alerter}: {operation}")]
    Unsupported { alerter: String, operation: String },

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl AlerterError {
    /// Whether the failure belongs to the retryable set (explicit retry,
    /// connection failure, timeout, rate limiting). Everything else is fatal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Retryable(_)
            | Self::Connection(_)
            | Self::Timeout(_)
            | Self::RateLimited { .. } => true,
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::Rejected(_)
            | Self::Unsupported { .. }
            | Self::Serialization(_)
            | Self::Other(_) => false,
        }
    }
}

impl From<reqwest::Error> for AlerterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connection(e.to_string())
        } else {
            Self::Http(e)
        }
    }
}
