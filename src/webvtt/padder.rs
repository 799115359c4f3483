use common::{PipelineError, StreamData, StreamPayload, TextSample};
use pipeline::{HandlerBase, MediaHandler};
use std::sync::Arc;

/// Fills gaps between text samples with empty cues so text segments cover
/// the timeline with no holes.
pub struct TextPadder {
    base: HandlerBase,
    last_end: i64,
}

impl TextPadder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: HandlerBase::new(),
            last_end: 0,
        }
    }
}

impl Default for TextPadder {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaHandler for TextPadder {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, data: StreamData) -> Result<(), PipelineError> {
        let stream_index = data.stream_index;
        match data.payload {
            StreamPayload::TextSample(sample) => {
                if sample.start_time > self.last_end {
                    self.base.dispatch_text_sample(
                        stream_index,
                        Arc::new(TextSample {
                            id: String::new(),
                            start_time: self.last_end,
                            end_time: sample.start_time,
                            settings: String::new(),
                            body: String::new(),
                        }),
                    )?;
                }
                self.last_end = self.last_end.max(sample.end_time);
                self.base.dispatch_text_sample(stream_index, sample)
            }
            other => self.base.dispatch(StreamData {
                stream_index,
                payload: other,
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pipeline::{add_handler, initialize, shared, testing::FakeSink};
    use pretty_assertions::assert_eq;

    fn cue(start: i64, end: i64, body: &str) -> Arc<TextSample> {
        Arc::new(TextSample {
            id: String::new(),
            start_time: start,
            end_time: end,
            settings: String::new(),
            body: body.to_owned(),
        })
    }

    #[test]
    fn test_pads_gaps() {
        let padder = shared(TextPadder::new());
        let sink = FakeSink::new();
        let log = sink.log();
        add_handler(&padder, &shared(sink)).unwrap();
        initialize(&padder).unwrap();

        let mut process =
            |s: Arc<TextSample>| padder.lock().unwrap().process(StreamData::from_text_sample(0, s));
        process(cue(1000, 2000, "a")).unwrap();
        process(cue(2000, 3000, "b")).unwrap();
        process(cue(5000, 6000, "c")).unwrap();

        let spans: Vec<(i64, i64, String)> = log
            .events()
            .into_iter()
            .filter_map(|data| match data.payload {
                StreamPayload::TextSample(s) => {
                    Some((s.start_time, s.end_time, s.body.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            vec![
                (0, 1000, String::new()),
                (1000, 2000, "a".to_owned()),
                (2000, 3000, "b".to_owned()),
                (3000, 5000, String::new()),
                (5000, 6000, "c".to_owned()),
            ],
            spans
        );
    }
}
