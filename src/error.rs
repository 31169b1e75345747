//! Error types shared across the crate.
//!
//! Every external collaborator has its own error enum. The lifecycle
//! controller converts all of them into [`CaseError`] before anything leaves
//! the `appeal` module.

use thiserror::Error;

/// Configuration resolution failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("missing required setting {key}")]
    Missing { key: String },

    #[error("failed to read settings file {path}: {reason}")]
    Settings { path: String, reason: String },
}

/// Persistence failures from any store backend.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DatabaseError {
    fn from(err: libsql::Error) -> Self {
        Self::Query(err.to_string())
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failures talking to the extraction/analysis endpoints.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{endpoint} is not configured")]
    NotConfigured { endpoint: String },

    #[error("{endpoint} request failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("{endpoint} reported an error: {message}")]
    Remote { endpoint: String, message: String },

    #[error("{endpoint} returned an unreadable response: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("failed to stage document {name}: {reason}")]
    Staging { name: String, reason: String },
}

/// File storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {bucket}/{path} not found")]
    NotFound { bucket: String, path: String },

    #[error("storage request failed: {0}")]
    Request(String),

    #[error("storage returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid storage path '{0}'")]
    InvalidPath(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Email transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("email transport is not configured: {0}")]
    NotConfigured(String),

    #[error("transport request failed: {0}")]
    Request(String),

    #[error("transport credentials expired or rejected")]
    AuthExpired,

    #[error("transport returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unreadable transport response: {0}")]
    Decode(String),

    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Channel (HTTP gateway) lifecycle failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}

/// Public error taxonomy of the case lifecycle.
///
/// Stale cache writes and unmatched replies are not errors here; the
/// controller handles both internally.
#[derive(Debug, Error)]
pub enum CaseError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("denial extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("case analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("email send failed: {0}")]
    SendFailed(String),

    #[error("cannot move case from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CaseError {
    pub fn case_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "case",
            id: id.to_string(),
        }
    }

    pub fn plan_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "plan",
            id: id.to_string(),
        }
    }

    /// Whether re-invoking the same operation is safe and may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExtractionFailed(_) | Self::AnalysisFailed(_))
    }
}
