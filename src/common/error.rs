use thiserror::Error;

/// Status returned by every pipeline operation. The first non-OK status stops
/// the graph; handlers propagate it upstream unchanged.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported stream: {0}")]
    UnsupportedStream(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("key server error: {0}")]
    Server(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    // Not an error. Used internally to signal the end of an input.
    #[error("end of stream")]
    EndOfStream,

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether a bounded retry may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TimedOut(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}
