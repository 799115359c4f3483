use common::{
    CueEvent, CueEventKind, PipelineError, Scte35Event, StreamData, StreamPayload,
};
use pipeline::{HandlerBase, MediaHandler};
use std::collections::HashSet;

/// One ad break position configured out of band.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AdCuePosition {
    pub start_time_in_seconds: f64,
    /// 0 for a cue point without a matching cue-in.
    pub duration_in_seconds: f64,
}

#[derive(Clone, Debug, Default)]
pub struct AdCueGeneratorParams {
    pub cue_points: Vec<AdCuePosition>,
}

/// Turns configured ad positions and upstream SCTE-35 markers into cue
/// events. The cue events ride ahead of the samples; the chunker holds them
/// until the sample that crosses their time.
pub struct AdCueGenerator {
    base: HandlerBase,
    params: AdCueGeneratorParams,
    // Streams that already received the configured cues.
    seeded: HashSet<usize>,
}

impl AdCueGenerator {
    #[must_use]
    pub fn new(params: AdCueGeneratorParams) -> Self {
        Self {
            base: HandlerBase::new(),
            params,
            seeded: HashSet::new(),
        }
    }

    fn dispatch_configured_cues(&mut self, stream_index: usize) -> Result<(), PipelineError> {
        let cues: Vec<CueEvent> = self
            .params
            .cue_points
            .iter()
            .flat_map(|position| cues_for_position(position))
            .collect();
        for cue in cues {
            self.base.dispatch_cue(stream_index, cue)?;
        }
        Ok(())
    }
}

fn cues_for_position(position: &AdCuePosition) -> Vec<CueEvent> {
    let mut cues = vec![CueEvent {
        kind: if position.duration_in_seconds > 0.0 {
            CueEventKind::CueOut
        } else {
            CueEventKind::CuePoint
        },
        time_in_seconds: position.start_time_in_seconds,
        cue_data: Vec::new(),
    }];
    if position.duration_in_seconds > 0.0 {
        cues.push(CueEvent {
            kind: CueEventKind::CueIn,
            time_in_seconds: position.start_time_in_seconds + position.duration_in_seconds,
            cue_data: Vec::new(),
        });
    }
    cues
}

fn cues_for_scte35(event: &Scte35Event) -> Vec<CueEvent> {
    cues_for_position(&AdCuePosition {
        start_time_in_seconds: event.start_time_in_seconds,
        duration_in_seconds: event.duration_in_seconds,
    })
    .into_iter()
    .map(|mut cue| {
        cue.cue_data = event.cue_data.clone();
        cue
    })
    .collect()
}

impl MediaHandler for AdCueGenerator {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, data: StreamData) -> Result<(), PipelineError> {
        let stream_index = data.stream_index;
        match data.payload {
            StreamPayload::StreamInfo(info) => {
                self.base.dispatch_stream_info(stream_index, info)?;
                if self.seeded.insert(stream_index) {
                    self.dispatch_configured_cues(stream_index)?;
                }
                Ok(())
            }
            StreamPayload::Scte35(event) => {
                for cue in cues_for_scte35(&event) {
                    self.base.dispatch_cue(stream_index, cue)?;
                }
                Ok(())
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
    use std::sync::Arc;

    fn stream_info() -> Arc<common::StreamInfo> {
        Arc::new(common::StreamInfo {
            codec: common::Codec::Aac,
            time_scale: 1000,
            duration: 0,
            codec_config: bytes::Bytes::new(),
            codec_string: String::new(),
            language: String::new(),
            is_encrypted: false,
            encryption_config: None,
            details: common::StreamDetails::Audio(common::AudioDetails::default()),
        })
    }

    fn captured_cues(log: &pipeline::testing::CaptureLog) -> Vec<(CueEventKind, f64)> {
        log.events()
            .into_iter()
            .filter_map(|data| match data.payload {
                StreamPayload::Cue(cue) => Some((cue.kind, cue.time_in_seconds)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_configured_cues_follow_stream_info() {
        let generator = shared(AdCueGenerator::new(AdCueGeneratorParams {
            cue_points: vec![AdCuePosition {
                start_time_in_seconds: 10.0,
                duration_in_seconds: 30.0,
            }],
        }));
        let sink = FakeSink::new();
        let log = sink.log();
        add_handler(&generator, &shared(sink)).unwrap();
        initialize(&generator).unwrap();

        generator
            .lock()
            .unwrap()
            .process(StreamData::from_stream_info(0, stream_info()))
            .unwrap();

        assert_eq!(
            vec![
                (CueEventKind::CueOut, 10.0),
                (CueEventKind::CueIn, 40.0),
            ],
            captured_cues(&log)
        );
        // Only once per stream.
        generator
            .lock()
            .unwrap()
            .process(StreamData::from_stream_info(0, stream_info()))
            .unwrap();
        assert_eq!(2, captured_cues(&log).len());
    }

    #[test]
    fn test_scte35_converted_to_cues() {
        let generator = shared(AdCueGenerator::new(AdCueGeneratorParams::default()));
        let sink = FakeSink::new();
        let log = sink.log();
        add_handler(&generator, &shared(sink)).unwrap();
        initialize(&generator).unwrap();

        generator
            .lock()
            .unwrap()
            .process(StreamData::from_scte35(
                0,
                Scte35Event {
                    id: "break1".to_owned(),
                    segmentation_type: 0x30,
                    start_time_in_seconds: 5.0,
                    duration_in_seconds: 15.0,
                    cue_data: vec![0xfc, 0x30],
                },
            ))
            .unwrap();

        let cues = captured_cues(&log);
        assert_eq!(
            vec![(CueEventKind::CueOut, 5.0), (CueEventKind::CueIn, 20.0)],
            cues
        );
        // The marker itself is consumed.
        assert!(log
            .events()
            .iter()
            .all(|e| !matches!(e.payload, StreamPayload::Scte35(_))));
    }
}
