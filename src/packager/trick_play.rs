use common::{MediaSample, PipelineError, StreamData, StreamPayload};
use pipeline::{HandlerBase, MediaHandler};

/// Thins a video stream down to every Nth key frame for trick-play tracks.
/// Kept frames absorb the duration of everything dropped after them.
pub struct TrickPlayHandler {
    base: HandlerBase,
    factor: u32,
    key_frames_seen: u64,
    held: Option<MediaSample>,
}

impl TrickPlayHandler {
    #[must_use]
    pub fn new(factor: u32) -> Self {
        Self {
            base: HandlerBase::new(),
            factor: factor.max(1),
            key_frames_seen: 0,
            held: None,
        }
    }

    fn on_media_sample(
        &mut self,
        stream_index: usize,
        sample: MediaSample,
    ) -> Result<(), PipelineError> {
        if !sample.is_key_frame {
            return Ok(());
        }
        self.key_frames_seen += 1;
        if (self.key_frames_seen - 1) % u64::from(self.factor) != 0 {
            return Ok(());
        }
        if let Some(mut held) = self.held.take() {
            held.duration = sample.dts - held.dts;
            self.base.dispatch_media_sample(stream_index, held)?;
        }
        self.held = Some(sample);
        Ok(())
    }
}

impl MediaHandler for TrickPlayHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, data: StreamData) -> Result<(), PipelineError> {
        let stream_index = data.stream_index;
        match data.payload {
            StreamPayload::MediaSample(sample) => self.on_media_sample(stream_index, sample),
            other => self.base.dispatch(StreamData {
                stream_index,
                payload: other,
            }),
        }
    }

    fn on_flush_request(&mut self, input_index: usize) -> Result<(), PipelineError> {
        if let Some(held) = self.held.take() {
            self.base.dispatch_media_sample(input_index, held)?;
        }
        self.base.flush_downstream(input_index)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pipeline::{add_handler, initialize, shared, testing::FakeSink};
    use pretty_assertions::assert_eq;

    fn sample(dts: i64, key: bool) -> MediaSample {
        MediaSample::new(dts, dts, 100, key, Bytes::from_static(b"f"))
    }

    #[test]
    fn test_keeps_every_other_key_frame() {
        let handler = shared(TrickPlayHandler::new(2));
        let sink = FakeSink::new();
        let log = sink.log();
        add_handler(&handler, &shared(sink)).unwrap();
        initialize(&handler).unwrap();

        // Key frames every 200 ticks, deltas in between.
        for i in 0..8_i64 {
            let key = i % 2 == 0;
            handler
                .lock()
                .unwrap()
                .process(StreamData::from_media_sample(0, sample(i * 100, key)))
                .unwrap();
        }
        handler.lock().unwrap().on_flush_request(0).unwrap();

        let kept: Vec<(i64, i64)> = log
            .media_samples()
            .iter()
            .map(|s| (s.dts, s.duration))
            .collect();
        // Key frames at 0, 200, 400, 600; every second one kept, covering
        // the gap to the next kept frame.
        assert_eq!(vec![(0, 400), (400, 100)], kept);
        assert!(log.media_samples().iter().all(|s| s.is_key_frame));
    }
}
