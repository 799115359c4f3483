use common::{MuxerListener, StreamInfo};
use std::sync::{Arc, Mutex};

/// One written segment, as reported by a muxer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRecord {
    pub output: String,
    pub file_name: String,
    pub start_timestamp: i64,
    pub duration: i64,
    pub file_size: u64,
}

/// Summary of one finished output stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaRecord {
    pub output: String,
    pub codec_string: String,
    pub time_scale: u32,
    pub media_duration: i64,
}

#[derive(Default)]
struct MediaInfoInner {
    segments: Vec<SegmentRecord>,
    media: Vec<MediaRecord>,
}

/// Shared collection of everything the muxers reported; the input to a
/// manifest writer and to the packaging tests.
#[derive(Clone, Default)]
pub struct VodMediaInfoLog(Arc<Mutex<MediaInfoInner>>);

impl VodMediaInfoLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn segments(&self) -> Vec<SegmentRecord> {
        self.0.lock().expect("poisoned").segments.clone()
    }

    #[must_use]
    pub fn media(&self) -> Vec<MediaRecord> {
        self.0.lock().expect("poisoned").media.clone()
    }
}

/// Muxer listener recording per-segment info into a [`VodMediaInfoLog`].
pub struct VodMediaInfoListener {
    log: VodMediaInfoLog,
    output: String,
    codec_string: String,
    time_scale: u32,
}

impl VodMediaInfoListener {
    #[must_use]
    pub fn new(log: VodMediaInfoLog, output: String) -> Self {
        Self {
            log,
            output,
            codec_string: String::new(),
            time_scale: 0,
        }
    }
}

impl MuxerListener for VodMediaInfoListener {
    fn on_media_start(&mut self, info: &StreamInfo) {
        self.codec_string = info.codec_string.clone();
        self.time_scale = info.time_scale;
    }

    fn on_new_segment(
        &mut self,
        file_name: &str,
        start_timestamp: i64,
        duration: i64,
        file_size: u64,
    ) {
        self.log
            .0
            .lock()
            .expect("poisoned")
            .segments
            .push(SegmentRecord {
                output: self.output.clone(),
                file_name: file_name.to_owned(),
                start_timestamp,
                duration,
                file_size,
            });
    }

    fn on_media_end(&mut self, media_duration: i64) {
        self.log.0.lock().expect("poisoned").media.push(MediaRecord {
            output: self.output.clone(),
            codec_string: self.codec_string.clone(),
            time_scale: self.time_scale,
            media_duration,
        });
    }
}
