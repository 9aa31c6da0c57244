//! Error types for the audit service

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;

/// Main error type for audit operations
#[derive(Error, Debug)]
pub enum AuditError {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP/Network errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database errors
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// LLM API errors
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// LLM response could not be parsed as JSON; carries a short prefix of the
    /// offending text so callers can log/report without dumping the whole body
    #[error("Failed to parse LLM JSON output (starts with: {prefix:?})")]
    LlmParse { prefix: String },

    /// Invalid file path
    #[error("Invalid file path: {0}")]
    InvalidPath(PathBuf),

    /// Attempted read escaped the repository root
    #[error("Path traversal attempt: {0}")]
    PathTraversal(PathBuf),

    /// Repository not found
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller is not authorized to perform the requested mutation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Parse error
    #[error("Parse error in {file}: {message}")]
    Parse { file: PathBuf, message: String },

    /// Rate limit exceeded after exhausting retries
    #[error("Rate limit exceeded for LLM API after retries")]
    RateLimitExceeded,

    /// Invalid API key
    #[error("Invalid or missing API key for {service}")]
    InvalidApiKey { service: String },

    /// Audit task failed; carries the accumulated cost at time of failure
    #[error("Audit failed: {message}")]
    AuditFailed { message: String, cost_usd: f64 },

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<AuditError>,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl AuditError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        AuditError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        AuditError::Config(msg.into())
    }

    /// Create an LLM API error
    pub fn llm_api(msg: impl Into<String>) -> Self {
        AuditError::LlmApi(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        AuditError::Other(msg.into())
    }

    /// True if this error kind should be retried by the LLM gateway's own
    /// retry loop rather than surfaced as a terminal failure immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuditError::LlmApi(_) | AuditError::Http(_))
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
