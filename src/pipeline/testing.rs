//! Shared test support for handler implementations in this workspace.

use crate::{HandlerBase, MediaHandler};
use common::{MediaSample, PipelineError, SegmentInfo, StreamData, StreamPayload};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CaptureInner {
    events: Vec<StreamData>,
    flushes: Vec<usize>,
}

/// Handle onto a [`FakeSink`]'s capture log, usable after the sink has been
/// moved into the graph.
#[derive(Clone, Default)]
pub struct CaptureLog(Arc<Mutex<CaptureInner>>);

impl CaptureLog {
    #[must_use]
    pub fn events(&self) -> Vec<StreamData> {
        self.0.lock().expect("poisoned").events.clone()
    }

    #[must_use]
    pub fn flushes(&self) -> Vec<usize> {
        self.0.lock().expect("poisoned").flushes.clone()
    }

    /// Media samples captured on any stream, in arrival order.
    #[must_use]
    pub fn media_samples(&self) -> Vec<MediaSample> {
        self.events()
            .into_iter()
            .filter_map(|data| match data.payload {
                StreamPayload::MediaSample(sample) => Some(sample),
                _ => None,
            })
            .collect()
    }

    /// Segment infos captured on any stream, in arrival order.
    #[must_use]
    pub fn segment_infos(&self) -> Vec<SegmentInfo> {
        self.events()
            .into_iter()
            .filter_map(|data| match data.payload {
                StreamPayload::SegmentInfo(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().expect("poisoned").events.clear();
    }
}

/// Terminal handler that records every event and flush it receives.
#[derive(Default)]
pub struct FakeSink {
    base: HandlerBase,
    log: CaptureLog,
}

impl FakeSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn log(&self) -> CaptureLog {
        self.log.clone()
    }
}

impl MediaHandler for FakeSink {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, data: StreamData) -> Result<(), PipelineError> {
        self.log.0.lock().expect("poisoned").events.push(data);
        Ok(())
    }

    fn on_flush_request(&mut self, input_index: usize) -> Result<(), PipelineError> {
        self.log.0.lock().expect("poisoned").flushes.push(input_index);
        Ok(())
    }
}

/// Terminal handler that fails every call with a fixed error.
pub struct FailingSink {
    base: HandlerBase,
    error: PipelineError,
}

impl FailingSink {
    #[must_use]
    pub fn new(error: PipelineError) -> Self {
        Self {
            base: HandlerBase::new(),
            error,
        }
    }
}

impl MediaHandler for FailingSink {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, _data: StreamData) -> Result<(), PipelineError> {
        Err(self.error.clone())
    }

    fn on_flush_request(&mut self, _input_index: usize) -> Result<(), PipelineError> {
        Err(self.error.clone())
    }
}
