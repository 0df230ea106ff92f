//! Error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors that stop a whole stage before any unit of work runs.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Prompt catalog error: {0}")]
    Catalog(String),

    #[error("Sentinel prompt id {sentinel} collides with catalog ids 0..{catalog_len}")]
    SentinelCollision { sentinel: u32, catalog_len: usize },

    #[error("Invalid source: {0}")]
    InvalidSource(PathBuf),

    #[error("Media backend error: {0}")]
    Media(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }
}

/// Errors from a single call to a remote generation service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Source file missing: {0}")]
    SourceMissing(PathBuf),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled before the call was issued")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Service produced no output: {0}")]
    NoOutput(String),

    #[error("OpenAI error: {0}")]
    OpenAi(#[from] async_openai::error::OpenAIError),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }

    /// Transient failures a caller may retry.
    ///
    /// Missing inputs, unparseable replies and absent outputs are
    /// deterministic and retrying will not change them.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Timeout(_) => true,
            ServiceError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ServiceError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
