//! Error handling and custom error types
//!
//! Provides unified error handling across the pipeline using thiserror, plus
//! the transient/permanent classification the retry layer relies on.

use crate::status::Status;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Upload rejected: {0}")]
    UploadRejected(String),

    #[error("Storage transport error: {0}")]
    Transport(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown request: {0}")]
    UnknownRequest(Uuid),

    #[error("Request {request_id} cannot move from {from} to {to}")]
    InvalidTransition {
        request_id: Uuid,
        from: Status,
        to: Status,
    },

    #[error("Request {0} already completed with a different result")]
    AlreadyCompleted(Uuid),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invariant violation: {0}")]
    Invariant(String),
}

impl Error {
    /// Whether retrying the same operation could plausibly succeed.
    ///
    /// Transport, broker, database and I/O failures are transient. Bad
    /// input, unsupported formats and state-machine conflicts are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Upload(_)
                | Error::Transport(_)
                | Error::Broker(_)
                | Error::Database(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
