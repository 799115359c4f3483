use crate::format_timestamp;
use common::{
    MuxerListener, PipelineError, SegmentInfo, StreamData, StreamInfo, StreamKind,
    StreamPayload, TextSample,
};
use pipeline::{HandlerBase, MediaHandler};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct WebVttMuxerOptions {
    /// Expands `$Number$` and `$Time$`, one file per segment.
    pub segment_template: String,
}

/// Terminal handler writing text samples into segmented WebVTT files.
pub struct WebVttMuxer {
    base: HandlerBase,
    options: WebVttMuxerOptions,
    listener: Box<dyn MuxerListener>,
    pending_cues: Vec<Arc<TextSample>>,
    segment_number: u32,
    total_duration: i64,
}

impl WebVttMuxer {
    #[must_use]
    pub fn new(options: WebVttMuxerOptions, listener: Box<dyn MuxerListener>) -> Self {
        Self {
            base: HandlerBase::new(),
            options,
            listener,
            pending_cues: Vec::new(),
            segment_number: 1,
            total_duration: 0,
        }
    }

    fn on_stream_info(&mut self, info: &Arc<StreamInfo>) -> Result<(), PipelineError> {
        if info.kind() != StreamKind::Text {
            return Err(PipelineError::InvalidArgument(
                "only text streams go to the webvtt muxer".to_owned(),
            ));
        }
        self.listener.on_media_start(info);
        Ok(())
    }

    fn on_segment_info(&mut self, info: &SegmentInfo) -> Result<(), PipelineError> {
        if info.is_subsegment {
            return Ok(());
        }
        let cues = std::mem::take(&mut self.pending_cues);

        let mut out = String::from("WEBVTT\n\n");
        for cue in &cues {
            // Empty padding cues exist for timeline bookkeeping only.
            if cue.body.is_empty() {
                continue;
            }
            if !cue.id.is_empty() {
                out.push_str(&cue.id);
                out.push('\n');
            }
            out.push_str(&format_timestamp(cue.start_time));
            out.push_str(" --> ");
            out.push_str(&format_timestamp(cue.end_time));
            if !cue.settings.is_empty() {
                out.push(' ');
                out.push_str(&cue.settings);
            }
            out.push('\n');
            out.push_str(&cue.body);
            out.push_str("\n\n");
        }

        let name = crate::expand_template(
            &self.options.segment_template,
            self.segment_number,
            info.start_timestamp,
        );
        self.segment_number += 1;
        std::fs::write(&name, out.as_bytes())?;
        self.total_duration += info.duration;
        self.listener.on_new_segment(
            &name,
            info.start_timestamp,
            info.duration,
            out.len().try_into().unwrap_or(u64::MAX),
        );
        Ok(())
    }
}

impl MediaHandler for WebVttMuxer {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, data: StreamData) -> Result<(), PipelineError> {
        match data.payload {
            StreamPayload::StreamInfo(info) => self.on_stream_info(&info),
            StreamPayload::TextSample(sample) => {
                self.pending_cues.push(sample);
                Ok(())
            }
            StreamPayload::SegmentInfo(info) => self.on_segment_info(&info),
            StreamPayload::Cue(_) | StreamPayload::Scte35(_) => Ok(()),
            StreamPayload::MediaSample(_) => Err(PipelineError::InvalidArgument(
                "media samples in a webvtt muxer".to_owned(),
            )),
        }
    }

    fn on_flush_request(&mut self, _input_index: usize) -> Result<(), PipelineError> {
        if !self.pending_cues.is_empty() {
            let start = self.pending_cues.first().map_or(0, |c| c.start_time);
            let end = self.pending_cues.iter().map(|c| c.end_time).max().unwrap_or(0);
            self.on_segment_info(&SegmentInfo {
                start_timestamp: start,
                duration: end - start,
                is_final_chunk: true,
                ..SegmentInfo::default()
            })?;
        }
        self.listener.on_media_end(self.total_duration);
        Ok(())
    }
}

#[must_use]
pub fn expand_template(template: &str, number: u32, time: i64) -> String {
    template
        .replace("$Number$", &number.to_string())
        .replace("$Time$", &time.to_string())
}
