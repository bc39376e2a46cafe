//! Error types for kiosync-core

use thiserror::Error;

/// Main error type for the kiosync-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A schema migration failed and was rolled back.
    ///
    /// Fatal: the store must not be used with a partially migrated schema.
    #[error("schema migration {version} ({name}) failed: {source}")]
    SchemaMigration {
        version: i64,
        name: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Payload rejected at enqueue time or undecodable at delivery time
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Record not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Aggregator focus exceeds the remote query fan-in limit
    #[error("too many linked records: {count} (max {max})")]
    TooManyLinkedRecords { count: usize, max: usize },

    /// Remote endpoint error
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A mutex guarding shared state was poisoned by a panicking holder
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

/// Failure reported by a remote endpoint or the document store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport-level failure (DNS, refused connection, reset)
    #[error("network error: {0}")]
    Network(String),

    /// The call did not complete within the configured bound
    #[error("request timed out")]
    Timeout,

    /// The endpoint answered with a non-success HTTP status
    #[error("API error ({code}): {body}")]
    Status { code: u16, body: String },

    /// No endpoint is configured for this kind
    #[error("endpoint not configured: {0}")]
    NotConfigured(String),
}

impl RemoteError {
    /// Network errors, timeouts and 5xx responses are retried; everything
    /// else is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => true,
            RemoteError::Status { code, .. } => (500..600).contains(code),
            RemoteError::NotConfigured(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if let Some(status) = e.status() {
            RemoteError::Status {
                code: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// Result type alias for kiosync-core
pub type Result<T> = std::result::Result<T, Error>;
