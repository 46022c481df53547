//! Error types for the signal pipeline

use std::fmt;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug)]
pub enum PipelineError {
    /// IO operation failed
    Io(std::io::Error),

    /// HTTP request failed
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Configuration error
    Config(String),

    /// Record store could not be read or written
    Storage(String),

    /// SQLite operation failed
    Database(rusqlite::Error),

    /// Upload was rejected or could not be delivered
    Upload(String),

    /// Transport error
    Transport(String),

    /// The per-session custom span limit was reached
    SpanLimitReached,

    /// The per-session log limit for the severity bucket was reached
    LogLimitReached,

    /// The event limit of a span was reached
    SpanEventLimitReached(String),

    /// The link limit of a span was reached
    SpanLinkLimitReached(String),

    /// The attribute limit of a span was reached
    SpanAttributeLimitReached(String),

    /// No session is active
    InvalidSession,

    /// Generic error with message
    Other(String),
}

impl PipelineError {
    /// Whether the error is an admission rejection from the limiter
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            PipelineError::SpanLimitReached
                | PipelineError::LogLimitReached
                | PipelineError::SpanEventLimitReached(_)
                | PipelineError::SpanLinkLimitReached(_)
                | PipelineError::SpanAttributeLimitReached(_)
        )
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Io(err) => write!(f, "IO error: {}", err),
            PipelineError::Http(err) => write!(f, "HTTP error: {}", err),
            PipelineError::Json(err) => write!(f, "JSON error: {}", err),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::Storage(msg) => write!(f, "Storage error: {}", msg),
            PipelineError::Database(err) => write!(f, "Database error: {}", err),
            PipelineError::Upload(msg) => write!(f, "Upload error: {}", msg),
            PipelineError::Transport(msg) => write!(f, "Transport error: {}", msg),
            PipelineError::SpanLimitReached => write!(f, "Span limit reached for the current session"),
            PipelineError::LogLimitReached => write!(f, "Log limit reached for the current session"),
            PipelineError::SpanEventLimitReached(msg) => write!(f, "Span event limit reached: {}", msg),
            PipelineError::SpanLinkLimitReached(msg) => write!(f, "Span link limit reached: {}", msg),
            PipelineError::SpanAttributeLimitReached(msg) => {
                write!(f, "Span attribute limit reached: {}", msg)
            }
            PipelineError::InvalidSession => write!(f, "No active session"),
            PipelineError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(err) => Some(err),
            PipelineError::Http(err) => Some(err),
            PipelineError::Json(err) => Some(err),
            PipelineError::Database(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Database(err)
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Http(err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Json(err)
    }
}
