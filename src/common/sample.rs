use crate::{DecryptConfig, EncryptionConfig, StreamInfo};
use bytes::Bytes;
use std::sync::Arc;

/// One coded media unit. Owned by the handler that produced it and moved to
/// the next handler; the payload buffer is reference counted so the
/// replicator can share it without copying.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaSample {
    /// Decode timestamp in the stream's time scale.
    pub dts: i64,
    /// Presentation timestamp in the stream's time scale.
    pub pts: i64,
    /// 0 if unknown.
    pub duration: i64,
    pub is_key_frame: bool,
    pub data: Bytes,
    /// Present when the sample was, or has been, encrypted.
    pub decrypt_config: Option<Box<DecryptConfig>>,
    pub side_data: Option<Bytes>,
}

impl MediaSample {
    #[must_use]
    pub fn new(dts: i64, pts: i64, duration: i64, is_key_frame: bool, data: Bytes) -> Self {
        Self {
            dts,
            pts,
            duration,
            is_key_frame,
            data,
            decrypt_config: None,
            side_data: None,
        }
    }
}

/// One text cue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextSample {
    pub id: String,
    /// Start time in the stream's time scale.
    pub start_time: i64,
    /// End time in the stream's time scale.
    pub end_time: i64,
    pub settings: String,
    pub body: String,
}

impl TextSample {
    #[must_use]
    pub fn duration(&self) -> i64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

/// Segment boundary marker, emitted after the samples it covers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Start timestamp in the stream's time scale.
    pub start_timestamp: i64,
    pub duration: i64,
    pub is_subsegment: bool,
    pub is_final_chunk: bool,
    pub is_encrypted: bool,
    /// Only set when key rotation is enabled. May be present even when the
    /// segment itself is in the clear lead.
    pub key_rotation_encryption_config: Option<EncryptionConfig>,
}

/// SCTE-35 cuepoint marker from the input stream or from packaging
/// parameters. Consumed by the ad-cue generator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scte35Event {
    pub id: String,
    /// Segmentation type id from the SCTE-35 segmentation descriptor.
    pub segmentation_type: i32,
    pub start_time_in_seconds: f64,
    pub duration_in_seconds: f64,
    pub cue_data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CueEventKind {
    CueIn,
    CueOut,
    #[default]
    CuePoint,
}

/// Ad insertion boundary. Forces a segment cut at the chunker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CueEvent {
    pub kind: CueEventKind,
    pub time_in_seconds: f64,
    pub cue_data: Vec<u8>,
}

/// The only message on the wire between handlers.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamPayload {
    StreamInfo(Arc<StreamInfo>),
    MediaSample(MediaSample),
    TextSample(Arc<TextSample>),
    SegmentInfo(SegmentInfo),
    Scte35(Scte35Event),
    Cue(CueEvent),
}

impl StreamPayload {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            StreamPayload::StreamInfo(_) => "stream info",
            StreamPayload::MediaSample(_) => "media sample",
            StreamPayload::TextSample(_) => "text sample",
            StreamPayload::SegmentInfo(_) => "segment info",
            StreamPayload::Scte35(_) => "scte35 event",
            StreamPayload::Cue(_) => "cue event",
        }
    }
}

/// Payload plus the stream index it rides on. The index is an input index
/// when entering `process` and an output index when dispatched.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamData {
    pub stream_index: usize,
    pub payload: StreamPayload,
}

impl StreamData {
    #[must_use]
    pub fn from_stream_info(stream_index: usize, info: Arc<StreamInfo>) -> Self {
        Self {
            stream_index,
            payload: StreamPayload::StreamInfo(info),
        }
    }

    #[must_use]
    pub fn from_media_sample(stream_index: usize, sample: MediaSample) -> Self {
        Self {
            stream_index,
            payload: StreamPayload::MediaSample(sample),
        }
    }

    #[must_use]
    pub fn from_text_sample(stream_index: usize, sample: Arc<TextSample>) -> Self {
        Self {
            stream_index,
            payload: StreamPayload::TextSample(sample),
        }
    }

    #[must_use]
    pub fn from_segment_info(stream_index: usize, info: SegmentInfo) -> Self {
        Self {
            stream_index,
            payload: StreamPayload::SegmentInfo(info),
        }
    }

    #[must_use]
    pub fn from_scte35(stream_index: usize, event: Scte35Event) -> Self {
        Self {
            stream_index,
            payload: StreamPayload::Scte35(event),
        }
    }

    #[must_use]
    pub fn from_cue(stream_index: usize, event: CueEvent) -> Self {
        Self {
            stream_index,
            payload: StreamPayload::Cue(event),
        }
    }

    /// Same payload on a different stream index.
    #[must_use]
    pub fn with_stream_index(mut self, stream_index: usize) -> Self {
        self.stream_index = stream_index;
        self
    }
}
