use crate::ChunkingParams;
use common::{
    time::seconds_to_ticks, CueEvent, MediaSample, PipelineError, SegmentInfo, StreamData,
    StreamInfo, StreamPayload, TextSample,
};
use pipeline::{HandlerBase, MediaHandler};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

struct StreamState {
    time_scale: u32,
    segment_ticks: i64,
    subsegment_ticks: i64,
    segment_start: Option<i64>,
    subsegment_start: i64,
    // End of the last forwarded sample, for the flush segment.
    last_sample_end: i64,
    // Cues waiting for the sample that crosses their time.
    pending_cues: VecDeque<CueEvent>,
}

impl StreamState {
    fn new(info: &StreamInfo, params: &ChunkingParams) -> Self {
        Self {
            time_scale: info.time_scale,
            segment_ticks: seconds_to_ticks(params.segment_duration_in_seconds, info.time_scale),
            subsegment_ticks: seconds_to_ticks(
                params.subsegment_duration_in_seconds,
                info.time_scale,
            ),
            segment_start: None,
            subsegment_start: 0,
            last_sample_end: 0,
            pending_cues: VecDeque::new(),
        }
    }
}

/// Splits continuous sample streams into segments of approximately the
/// configured duration, aligned to stream access points when requested.
/// `SegmentInfo` events trail the samples they cover. Pending cue events
/// force a boundary right before the first sample at or past their time.
pub struct ChunkingHandler {
    base: HandlerBase,
    params: ChunkingParams,
    streams: HashMap<usize, StreamState>,
}

impl ChunkingHandler {
    #[must_use]
    pub fn new(params: ChunkingParams) -> Self {
        Self {
            base: HandlerBase::new(),
            params,
            streams: HashMap::new(),
        }
    }

    fn state(&mut self, stream_index: usize) -> Result<&mut StreamState, PipelineError> {
        self.streams.get_mut(&stream_index).ok_or_else(|| {
            PipelineError::Internal(format!(
                "sample before stream info on stream {stream_index}"
            ))
        })
    }

    fn on_sample(
        &mut self,
        stream_index: usize,
        dts: i64,
        duration: i64,
        is_key_frame: bool,
    ) -> Result<(), PipelineError> {
        self.cut_pending_cues(stream_index, dts)?;

        let sap_aligned = self.params.segment_sap_aligned;
        let subsegment_sap_aligned = self.params.subsegment_sap_aligned;
        let state = self.state(stream_index)?;

        match state.segment_start {
            None => {
                state.segment_start = Some(dts);
                state.subsegment_start = dts;
            }
            Some(start) => {
                let cut_allowed = is_key_frame || !sap_aligned;
                if cut_allowed && dts >= start + state.segment_ticks {
                    let info = SegmentInfo {
                        start_timestamp: start,
                        duration: dts - start,
                        ..SegmentInfo::default()
                    };
                    state.segment_start = Some(dts);
                    state.subsegment_start = dts;
                    self.base.dispatch_segment_info(stream_index, info)?;
                } else if state.subsegment_ticks > 0 {
                    let subsegment_cut_allowed = is_key_frame || !subsegment_sap_aligned;
                    if subsegment_cut_allowed
                        && dts >= state.subsegment_start + state.subsegment_ticks
                    {
                        let info = SegmentInfo {
                            start_timestamp: state.subsegment_start,
                            duration: dts - state.subsegment_start,
                            is_subsegment: true,
                            ..SegmentInfo::default()
                        };
                        state.subsegment_start = dts;
                        self.base.dispatch_segment_info(stream_index, info)?;
                    }
                }
            }
        }

        let state = self.state(stream_index)?;
        state.last_sample_end = dts + duration.max(0);
        Ok(())
    }

    // Flush the open segment at each cue time crossed by `dts`, forwarding
    // the cue between the two segments.
    fn cut_pending_cues(&mut self, stream_index: usize, dts: i64) -> Result<(), PipelineError> {
        loop {
            let state = self.state(stream_index)?;
            let Some(cue) = state.pending_cues.front() else {
                return Ok(());
            };
            let cue_ticks = seconds_to_ticks(cue.time_in_seconds, state.time_scale);
            if cue_ticks > dts {
                return Ok(());
            }
            let cue = state.pending_cues.pop_front().expect("front exists");

            if let Some(start) = state.segment_start {
                let info = SegmentInfo {
                    start_timestamp: start,
                    duration: (cue_ticks - start).max(0),
                    ..SegmentInfo::default()
                };
                state.segment_start = Some(cue_ticks);
                state.subsegment_start = cue_ticks;
                self.base.dispatch_segment_info(stream_index, info)?;
            }
            self.base.dispatch_cue(stream_index, cue)?;
        }
    }

    fn on_stream_info(
        &mut self,
        stream_index: usize,
        info: &Arc<StreamInfo>,
    ) -> Result<(), PipelineError> {
        self.streams
            .insert(stream_index, StreamState::new(info, &self.params));
        self.base.dispatch_stream_info(stream_index, info.clone())
    }

    fn on_media_sample(
        &mut self,
        stream_index: usize,
        sample: MediaSample,
    ) -> Result<(), PipelineError> {
        self.on_sample(
            stream_index,
            sample.dts,
            sample.duration,
            sample.is_key_frame,
        )?;
        self.base.dispatch_media_sample(stream_index, sample)
    }

    fn on_text_sample(
        &mut self,
        stream_index: usize,
        sample: Arc<TextSample>,
    ) -> Result<(), PipelineError> {
        // Text samples can start a segment anywhere.
        self.on_sample(stream_index, sample.start_time, sample.duration(), true)?;
        self.base.dispatch_text_sample(stream_index, sample)
    }

    // An upstream boundary: adopt it instead of cutting again, so an
    // already-chunked stream passes through without new segment infos.
    fn on_segment_info(
        &mut self,
        stream_index: usize,
        info: SegmentInfo,
    ) -> Result<(), PipelineError> {
        let state = self.state(stream_index)?;
        if !info.is_subsegment {
            state.segment_start = None;
        }
        self.base.dispatch_segment_info(stream_index, info)
    }
}

impl MediaHandler for ChunkingHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn initialize_internal(&mut self) -> Result<(), PipelineError> {
        self.params.validate()
    }

    fn process(&mut self, data: StreamData) -> Result<(), PipelineError> {
        let stream_index = data.stream_index;
        match data.payload {
            StreamPayload::StreamInfo(info) => self.on_stream_info(stream_index, &info),
            StreamPayload::MediaSample(sample) => self.on_media_sample(stream_index, sample),
            StreamPayload::TextSample(sample) => self.on_text_sample(stream_index, sample),
            StreamPayload::SegmentInfo(info) => self.on_segment_info(stream_index, info),
            StreamPayload::Cue(cue) => {
                self.state(stream_index)?.pending_cues.push_back(cue);
                Ok(())
            }
            StreamPayload::Scte35(event) => self.base.dispatch_scte35(stream_index, event),
        }
    }

    fn on_flush_request(&mut self, input_index: usize) -> Result<(), PipelineError> {
        if let Some(state) = self.streams.get_mut(&input_index) {
            let remaining_cues: Vec<CueEvent> = state.pending_cues.drain(..).collect();
            if let Some(start) = state.segment_start.take() {
                let info = SegmentInfo {
                    start_timestamp: start,
                    duration: (state.last_sample_end - start).max(0),
                    is_final_chunk: true,
                    ..SegmentInfo::default()
                };
                self.base.dispatch_segment_info(input_index, info)?;
            }
            for cue in remaining_cues {
                self.base.dispatch_cue(input_index, cue)?;
            }
        }
        self.base.flush_downstream(input_index)
    }
}
