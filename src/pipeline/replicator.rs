use crate::{HandlerBase, MediaHandler};
use common::{PipelineError, StreamData};

/// Takes a single input and sends every event to all downstream handlers in
/// output-index order. Events are not deep copies; sample payloads are
/// reference counted and downstream handlers must not mutate them in place.
#[derive(Default)]
pub struct Replicator {
    base: HandlerBase,
}

impl Replicator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MediaHandler for Replicator {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, data: StreamData) -> Result<(), PipelineError> {
        for output_index in 0..self.base.num_output_streams() {
            self.base
                .dispatch(data.clone().with_stream_index(output_index))?;
        }
        Ok(())
    }

    fn on_flush_request(&mut self, _input_index: usize) -> Result<(), PipelineError> {
        self.base.flush_all_downstreams()
    }
}
