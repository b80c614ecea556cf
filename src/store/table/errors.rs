//! Table Service Error Types
//!
//! Maps HTTP status codes from the table REST API to specific variants
//! so retry decisions don't depend on message text.

/// Table service error types
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("Authorization rejected: SAS token expired or invalid")]
    AuthExpired,

    #[error("Throttled by the table service")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),

    #[error("Malformed entity: {0}")]
    Entity(String),
}

impl TableError {
    /// Whether this error is retryable
    ///
    /// A rejected SAS token cannot be refreshed from here, so auth failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TableError::RateLimited
                | TableError::Timeout
                | TableError::Network(_)
                | TableError::Server(_, _)
        )
    }

    /// Create a TableError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => TableError::AuthExpired,
            403 => TableError::Forbidden(body.to_string()),
            404 => TableError::NotFound(body.to_string()),
            408 => TableError::Timeout,
            409 => TableError::Conflict(body.to_string()),
            412 => TableError::PreconditionFailed(body.to_string()),
            429 => TableError::RateLimited,
            500..=599 => TableError::Server(status, body.to_string()),
            _ => TableError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for TableError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TableError::Timeout
        } else if err.is_connect() || err.is_request() {
            TableError::Network(err.to_string())
        } else if err.is_decode() {
            TableError::Entity(err.to_string())
        } else {
            TableError::Request(err.to_string())
        }
    }
}
