use crate::MediaHandler;
use common::PipelineError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Concurrently settable cancellation flag. Cloned out of the origin before
/// the pipeline thread takes the handler lock, so `cancel` never blocks.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A handler at the head of a pipeline. Origins take input from an external
/// source (a file, a buffered byte stream) instead of from `process`.
pub trait OriginHandler: MediaHandler {
    /// Drive the whole pipeline. Blocks until the input is exhausted, the
    /// pipeline fails, or the cancel token is set. The producer loop must
    /// test the token between samples and return `Cancelled` on observing
    /// it; downstream handlers learn of cancellation through the terminal
    /// flush.
    fn run(&mut self) -> Result<(), PipelineError>;

    /// Token for requesting that `run` exits early.
    fn cancel_token(&self) -> CancelToken;
}
