// SPDX-License-Identifier: GPL-2.0-or-later

//! The media handler framework. Handlers are the nodes of a packaging
//! pipeline; events flow downstream only, one event in flight at a time.
//!
//! Three handler shapes are supported:
//!   1) single input, single output (most handlers),
//!   2) N inputs, N outputs where output i derives from input i,
//!   3) single input, N outputs (the replicator).
//! Any other shape is rejected at initialization.

mod origin;
mod replicator;
pub mod testing;

#[cfg(test)]
mod test;

pub use origin::{CancelToken, OriginHandler};
pub use replicator::Replicator;

use common::{
    CueEvent, MediaSample, PipelineError, Scte35Event, SegmentInfo, StreamData, StreamInfo,
    TextSample,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

pub type SharedHandler = Arc<Mutex<dyn MediaHandler + Send>>;

/// Wrap a handler for graph wiring.
#[must_use]
pub fn shared<H: MediaHandler + Send + 'static>(handler: H) -> SharedHandler {
    Arc::new(Mutex::new(handler))
}

/// A node in the pipeline graph. Implementations embed a [`HandlerBase`] for
/// the wiring state and dispatch helpers.
pub trait MediaHandler {
    fn base(&self) -> &HandlerBase;
    fn base_mut(&mut self) -> &mut HandlerBase;

    /// One-time setup after the graph is wired. Only the handler itself;
    /// downstream handlers are initialized by [`initialize`].
    fn initialize_internal(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Process one event. `data.stream_index` is an input index; the
    /// implementation re-dispatches derived events with the output index
    /// rewritten via the base dispatch helpers.
    fn process(&mut self, data: StreamData) -> Result<(), PipelineError>;

    /// No further events will arrive on this input. Flush pending state and
    /// forward the flush to every output derived from this input.
    fn on_flush_request(&mut self, input_index: usize) -> Result<(), PipelineError> {
        self.base_mut().flush_downstream(input_index)
    }
}

/// Wiring state shared by all handlers: the output table, initialization
/// flag, and the error latch that stops the graph after the first failure.
#[derive(Default)]
pub struct HandlerBase {
    initialized: bool,
    num_input_streams: usize,
    next_output_index: usize,
    // output index -> (downstream handler, downstream input index).
    outputs: BTreeMap<usize, (SharedHandler, usize)>,
    failed: Option<PipelineError>,
}

impl HandlerBase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn num_input_streams(&self) -> usize {
        self.num_input_streams
    }

    #[must_use]
    pub fn num_output_streams(&self) -> usize {
        self.outputs.len()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.num_input_streams > 0
    }

    #[must_use]
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    fn claim_input_index(&mut self) -> usize {
        let index = self.num_input_streams;
        self.num_input_streams += 1;
        index
    }

    /// Forward `data` to the downstream connected at `data.stream_index`,
    /// rewriting the index to the downstream's input index.
    pub fn dispatch(&mut self, data: StreamData) -> Result<(), PipelineError> {
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        let Some((downstream, input_index)) = self.outputs.get(&data.stream_index) else {
            return Err(PipelineError::InvalidArgument(format!(
                "output stream {} is not connected",
                data.stream_index
            )));
        };
        let data = data.with_stream_index(*input_index);
        let result = downstream.lock().expect("poisoned handler").process(data);
        if let Err(e) = &result {
            self.failed = Some(e.clone());
        }
        result
    }

    pub fn dispatch_stream_info(
        &mut self,
        stream_index: usize,
        info: Arc<StreamInfo>,
    ) -> Result<(), PipelineError> {
        self.dispatch(StreamData::from_stream_info(stream_index, info))
    }

    pub fn dispatch_media_sample(
        &mut self,
        stream_index: usize,
        sample: MediaSample,
    ) -> Result<(), PipelineError> {
        self.dispatch(StreamData::from_media_sample(stream_index, sample))
    }

    pub fn dispatch_text_sample(
        &mut self,
        stream_index: usize,
        sample: Arc<TextSample>,
    ) -> Result<(), PipelineError> {
        self.dispatch(StreamData::from_text_sample(stream_index, sample))
    }

    pub fn dispatch_segment_info(
        &mut self,
        stream_index: usize,
        info: SegmentInfo,
    ) -> Result<(), PipelineError> {
        self.dispatch(StreamData::from_segment_info(stream_index, info))
    }

    pub fn dispatch_scte35(
        &mut self,
        stream_index: usize,
        event: Scte35Event,
    ) -> Result<(), PipelineError> {
        self.dispatch(StreamData::from_scte35(stream_index, event))
    }

    pub fn dispatch_cue(
        &mut self,
        stream_index: usize,
        event: CueEvent,
    ) -> Result<(), PipelineError> {
        self.dispatch(StreamData::from_cue(stream_index, event))
    }

    /// Flush the downstream connected at `output_index`. A terminal handler
    /// with no output at that index is a no-op.
    pub fn flush_downstream(&mut self, output_index: usize) -> Result<(), PipelineError> {
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        let Some((downstream, input_index)) = self.outputs.get(&output_index) else {
            return Ok(());
        };
        let result = downstream
            .lock()
            .expect("poisoned handler")
            .on_flush_request(*input_index);
        if let Err(e) = &result {
            self.failed = Some(e.clone());
        }
        result
    }

    /// Flush every connected downstream, in output-index order.
    pub fn flush_all_downstreams(&mut self) -> Result<(), PipelineError> {
        let indices: Vec<usize> = self.outputs.keys().copied().collect();
        for index in indices {
            self.flush_downstream(index)?;
        }
        Ok(())
    }
}

/// Connect `downstream` at the given output index of `upstream`. The
/// downstream input index is assigned automatically, one per connection.
pub fn connect(
    upstream: &SharedHandler,
    output_index: usize,
    downstream: &SharedHandler,
) -> Result<(), PipelineError> {
    if Arc::ptr_eq(upstream, downstream) {
        return Err(PipelineError::InvalidArgument(
            "handler cannot be connected to itself".to_owned(),
        ));
    }
    let mut up = upstream.lock().expect("poisoned handler");
    let base = up.base_mut();
    if base.outputs.contains_key(&output_index) {
        return Err(PipelineError::InvalidArgument(format!(
            "output stream {output_index} is already connected"
        )));
    }
    let input_index = downstream
        .lock()
        .expect("poisoned handler")
        .base_mut()
        .claim_input_index();
    base.outputs
        .insert(output_index, (downstream.clone(), input_index));
    if output_index >= base.next_output_index {
        base.next_output_index = output_index + 1;
    }
    Ok(())
}

/// Connect `downstream` at the next available output index of `upstream`.
pub fn add_handler(
    upstream: &SharedHandler,
    downstream: &SharedHandler,
) -> Result<(), PipelineError> {
    let output_index = upstream
        .lock()
        .expect("poisoned handler")
        .base()
        .next_output_index;
    connect(upstream, output_index, downstream)
}

/// Connect the handlers into a chain, head to tail.
pub fn chain(handlers: &[SharedHandler]) -> Result<(), PipelineError> {
    for pair in handlers.windows(2) {
        add_handler(&pair[0], &pair[1])?;
    }
    Ok(())
}

/// Initialize `handler` and every handler reachable downstream, each exactly
/// once. Re-invocation is idempotent. Fails with `InvalidArgument` on a
/// disallowed graph shape.
pub fn initialize(handler: &SharedHandler) -> Result<(), PipelineError> {
    let downstreams = {
        let mut h = handler.lock().expect("poisoned handler");
        if h.base().initialized {
            return Ok(());
        }
        validate_shape(h.base())?;
        h.initialize_internal()?;
        let base = h.base_mut();
        base.initialized = true;
        base.outputs
            .values()
            .map(|(handler, _)| handler.clone())
            .collect::<Vec<_>>()
    };
    for downstream in downstreams {
        initialize(&downstream)?;
    }
    Ok(())
}

fn validate_shape(base: &HandlerBase) -> Result<(), PipelineError> {
    let inputs = base.num_input_streams;
    let outputs = base.outputs.len();

    // Output indices must be contiguous from zero.
    if base.next_output_index != outputs {
        return Err(PipelineError::InvalidArgument(format!(
            "output streams must be connected contiguously, got {outputs} \
             connections with max index {}",
            base.next_output_index.saturating_sub(1)
        )));
    }

    let allowed = match (inputs, outputs) {
        // Origin: produces without upstream input.
        (0, o) => o >= 1,
        // Sink: consumes without downstream.
        (_, 0) => true,
        // Transformer or bulk processor.
        (i, o) if i == o => true,
        // Fan-out.
        (1, o) => o > 1,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(PipelineError::InvalidArgument(format!(
            "unsupported handler shape: {inputs} inputs, {outputs} outputs"
        )))
    }
}
