//! Shared error taxonomy for the Janitor control plane.
//!
//! Every service-level failure is classified into one of these variants;
//! the classification decides both the HTTP status reported to callers and
//! whether the supervising loop should retry.

/// Common error type for all Janitor services.
#[derive(Debug, thiserror::Error)]
pub enum JanitorError {
    /// Malformed request; no state was changed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A state-machine precondition failed (e.g. finishing an
    /// already-finished run). Safe to treat as idempotent.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A bucket or forge limit was hit.
    #[error("Rate limited{}", retry_after.map(|d| format!(", retry after {}s", d.num_seconds())).unwrap_or_default())]
    RateLimited {
        /// How long the caller should wait before retrying, if known.
        retry_after: Option<chrono::Duration>,
    },

    /// A forge, VCS or network flake; retry with backoff.
    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    /// An authoritative negative response; the affected record is terminal.
    #[error("Permanent backend error: {0}")]
    PermanentBackend(String),

    /// Database-related errors.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication/authorization errors.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Resource not found.
    #[error("Not found: {resource} '{id}'")]
    NotFound {
        /// Kind of resource that was looked up.
        resource: String,
        /// Identifier that did not resolve.
        id: String,
    },

    /// Unexpected; logged with the affected id and retried by the
    /// supervising loop.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JanitorError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the error is transient (worth retrying).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Io(_)) => true,
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::RateLimited { .. } => true,
            Self::TransientBackend(_) => true,
            _ => false,
        }
    }

    /// Get the appropriate HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Auth(_) => 401,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::RateLimited { .. } => 429,
            Self::PermanentBackend(_) => 502,
            Self::TransientBackend(_) => 503,
            _ => 500,
        }
    }

    /// Value for the `Retry-After` response header, in seconds.
    pub fn retry_after(&self) -> Option<i64> {
        match self {
            Self::RateLimited { retry_after } => retry_after.map(|d| d.num_seconds().max(1)),
            _ => None,
        }
    }
}

/// Result type alias using JanitorError.
pub type Result<T> = std::result::Result<T, JanitorError>;

impl From<url::ParseError> for JanitorError {
    fn from(e: url::ParseError) -> Self {
        Self::Validation(format!("Invalid URL: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_codes() {
        assert_eq!(JanitorError::validation("bad").http_status(), 400);
        assert_eq!(JanitorError::not_found("run", "x").http_status(), 404);
        assert_eq!(JanitorError::conflict("done").http_status(), 409);
        assert_eq!(
            JanitorError::RateLimited { retry_after: None }.http_status(),
            429
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(JanitorError::TransientBackend("flake".into()).is_transient());
        assert!(JanitorError::RateLimited { retry_after: None }.is_transient());
        assert!(!JanitorError::PermanentBackend("404".into()).is_transient());
        assert!(!JanitorError::validation("bad").is_transient());
    }

    #[test]
    fn test_retry_after_header() {
        let e = JanitorError::RateLimited {
            retry_after: Some(chrono::Duration::seconds(90)),
        };
        assert_eq!(e.retry_after(), Some(90));
        assert_eq!(JanitorError::validation("x").retry_after(), None);
    }
}
