//! Typed error taxonomy surfaced from the public pipeline API.

use std::path::PathBuf;

/// Errors the pipeline can raise.
///
/// `Cancelled` is not a failure — it is how every worker and blocked reader
/// observes shutdown. Callers should not log it as an error.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("failed to load model at {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("accelerator I/O error on stream {stream}: {reason}")]
    AcceleratorIo { stream: usize, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("pipeline invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// True for errors that represent routine shutdown rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}
