//! B2 API errors
//!
//! Status-code classification for B2 responses and its translation into the
//! crate-wide `SyncError`.

use crate::error::SyncError;

/// B2 API error types
#[derive(Debug, thiserror::Error)]
pub enum B2Error {
    #[error("B2 auth token expired")]
    AuthExpired,

    #[error("B2 rate limit hit")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),
}

impl B2Error {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            B2Error::RateLimited
                | B2Error::Timeout
                | B2Error::Network(_)
                | B2Error::Server(_, _)
                | B2Error::AuthExpired
        )
    }

    /// Create a B2Error from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => B2Error::AuthExpired,
            403 => B2Error::Forbidden(body.to_string()),
            404 => B2Error::NotFound(body.to_string()),
            408 => B2Error::Timeout,
            429 => B2Error::RateLimited,
            500..=599 => B2Error::Server(status, body.to_string()),
            _ => B2Error::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for B2Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            B2Error::Timeout
        } else if let Some(status) = e.status() {
            B2Error::from_status(status.as_u16(), &e.to_string())
        } else if e.is_decode() {
            B2Error::Request(e.to_string())
        } else {
            B2Error::Network(e.to_string())
        }
    }
}

impl From<B2Error> for SyncError {
    fn from(e: B2Error) -> Self {
        match e {
            B2Error::NotFound(what) => SyncError::NotFound(what),
            B2Error::Forbidden(_) | B2Error::Request(_) => SyncError::Rejected(e.to_string()),
            _ => SyncError::TransientNetwork(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(B2Error::from_status(401, ""), B2Error::AuthExpired));
        assert!(matches!(B2Error::from_status(404, "x"), B2Error::NotFound(_)));
        assert!(matches!(B2Error::from_status(503, "x"), B2Error::Server(503, _)));
        assert!(matches!(B2Error::from_status(400, "bad"), B2Error::Request(_)));
    }

    #[test]
    fn test_sync_error_conversion_keeps_retry_semantics() {
        for err in [
            B2Error::RateLimited,
            B2Error::Timeout,
            B2Error::Server(500, "boom".into()),
            B2Error::Network("reset".into()),
        ] {
            assert!(err.is_retryable());
            assert!(SyncError::from(err).is_retryable());
        }

        assert!(SyncError::from(B2Error::NotFound("f".into())).is_not_found());
        assert!(matches!(
            SyncError::from(B2Error::Forbidden("key".into())),
            SyncError::Rejected(_)
        ));
    }
}
