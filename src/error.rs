//! Error kinds shared by the file store, the pipeline registry, and the
//! execution dispatcher.
//!
//! Core operations return [`ServeError`] and stay free of transport
//! concerns. The HTTP layer ([`crate::server`]) maps each variant to a
//! status code and the `{"errors": [...]}` envelope.

use thiserror::Error;

/// Result alias for core operations.
pub type ServeResult<T> = std::result::Result<T, ServeError>;

#[derive(Debug, Error)]
pub enum ServeError {
    /// A client-supplied path normalizes to somewhere outside the storage root.
    #[error("'{0}' resolves outside of the storage root.")]
    PathEscape(String),

    /// The request itself is malformed (bad multipart body, no file name, bad JSON).
    #[error("{0}")]
    BadRequest(String),

    /// The upload target already exists.
    #[error("A file with the same name already exist. Rename it and try again.")]
    Conflict,

    /// Unknown pipeline, node, or filesystem path. The message lists the
    /// valid alternatives when there are any.
    #[error("{0}")]
    NotFound(String),

    /// The pipeline engine raised while running.
    #[error("Pipeline '{pipeline}' failed. Exception: {message}")]
    Execution { pipeline: String, message: String },

    /// Unexpected filesystem object type or I/O failure.
    #[error("{0}")]
    Internal(String),
}

impl From<std::io::Error> for ServeError {
    fn from(err: std::io::Error) -> Self {
        ServeError::Internal(err.to_string())
    }
}
