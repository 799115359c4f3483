// SPDX-License-Identifier: GPL-2.0-or-later

//! WebVTT handling: parsing cue files into text samples, padding timeline
//! gaps, and writing segmented WebVTT output.

mod muxer;
mod padder;

pub use muxer::*;
pub use padder::*;

use bytes::Bytes;
use common::{Codec, PipelineError, StreamData, StreamDetails, StreamInfo, TextSample};
use pipeline::{CancelToken, HandlerBase, MediaHandler, OriginHandler};
use std::sync::Arc;
use thiserror::Error;

/// Text streams run on a millisecond time scale.
pub const TEXT_TIMESCALE: u32 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebVttError {
    #[error("missing WEBVTT header")]
    MissingHeader,

    #[error("invalid timestamp: '{0}'")]
    InvalidTimestamp(String),

    #[error("invalid cue timing line: '{0}'")]
    InvalidTimingLine(String),
}

/// Parse `HH:MM:SS.mmm` or `MM:SS.mmm` into milliseconds.
pub fn parse_timestamp(s: &str) -> Result<i64, WebVttError> {
    let invalid = || WebVttError::InvalidTimestamp(s.to_owned());
    let (rest, millis) = s.split_once('.').ok_or_else(invalid)?;
    if millis.len() != 3 {
        return Err(invalid());
    }
    let millis: i64 = millis.parse().map_err(|_| invalid())?;

    let parts: Vec<&str> = rest.split(':').collect();
    let (hours, minutes, seconds): (i64, i64, i64) = match parts.as_slice() {
        [h, m, s] => (
            h.parse().map_err(|_| invalid())?,
            m.parse().map_err(|_| invalid())?,
            s.parse().map_err(|_| invalid())?,
        ),
        [m, s] => (
            0_i64,
            m.parse().map_err(|_| invalid())?,
            s.parse().map_err(|_| invalid())?,
        ),
        _ => return Err(invalid()),
    };
    if minutes >= 60 || seconds >= 60 {
        return Err(invalid());
    }
    Ok(((hours * 60 + minutes) * 60 + seconds) * 1000 + millis)
}

/// Format milliseconds as `HH:MM:SS.mmm`.
#[must_use]
pub fn format_timestamp(ms: i64) -> String {
    let ms = ms.max(0);
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let seconds = (ms / 1000) % 60;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

/// Parse a complete WebVTT document into cues.
pub fn parse_cues(text: &str) -> Result<Vec<TextSample>, WebVttError> {
    let mut lines = text.lines();
    let header = lines.next().ok_or(WebVttError::MissingHeader)?;
    if !header.trim_start_matches('\u{feff}').starts_with("WEBVTT") {
        return Err(WebVttError::MissingHeader);
    }

    let mut cues = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    for line in lines.chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if !block.is_empty() {
                if let Some(cue) = parse_cue_block(&block)? {
                    cues.push(cue);
                }
                block.clear();
            }
            continue;
        }
        block.push(line);
    }
    Ok(cues)
}

fn parse_cue_block(block: &[&str]) -> Result<Option<TextSample>, WebVttError> {
    // NOTE and STYLE blocks carry no cue.
    if block[0].starts_with("NOTE") || block[0].starts_with("STYLE") {
        return Ok(None);
    }

    let (id, timing_index) = if block[0].contains("-->") {
        (String::new(), 0)
    } else {
        if block.len() < 2 {
            return Ok(None);
        }
        (block[0].to_owned(), 1)
    };

    let timing = block[timing_index];
    let (times, settings) = match timing.split_once("-->") {
        Some((start, rest)) => {
            let rest = rest.trim_start();
            match rest.split_once(char::is_whitespace) {
                Some((end, settings)) => ((start.trim(), end.trim()), settings.trim().to_owned()),
                None => ((start.trim(), rest.trim()), String::new()),
            }
        }
        None => return Err(WebVttError::InvalidTimingLine(timing.to_owned())),
    };

    let start_time = parse_timestamp(times.0)?;
    let end_time = parse_timestamp(times.1)?;
    let body = block[timing_index + 1..].join("\n");
    Ok(Some(TextSample {
        id,
        start_time,
        end_time,
        settings,
        body,
    }))
}

/// Origin handler reading one WebVTT file. Single output stream.
pub struct WebVttParser {
    base: HandlerBase,
    text: String,
    cancel: CancelToken,
}

impl WebVttParser {
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self {
            base: HandlerBase::new(),
            text: String::from_utf8_lossy(&data).into_owned(),
            cancel: CancelToken::new(),
        }
    }
}

impl MediaHandler for WebVttParser {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, _data: StreamData) -> Result<(), PipelineError> {
        Err(PipelineError::Internal(
            "origin handlers do not accept input".to_owned(),
        ))
    }
}

impl OriginHandler for WebVttParser {
    fn run(&mut self) -> Result<(), PipelineError> {
        let cues = parse_cues(&self.text).map_err(|e| PipelineError::Parse(e.to_string()))?;
        let duration = cues.iter().map(|c| c.end_time).max().unwrap_or(0);

        self.base.dispatch_stream_info(
            0,
            Arc::new(StreamInfo {
                codec: Codec::WebVtt,
                time_scale: TEXT_TIMESCALE,
                duration,
                codec_config: Bytes::new(),
                codec_string: "wvtt".to_owned(),
                language: String::new(),
                is_encrypted: false,
                encryption_config: None,
                details: StreamDetails::Text,
            }),
        )?;

        for cue in cues {
            if self.cancel.is_cancelled() {
                self.base.flush_all_downstreams()?;
                return Err(PipelineError::Cancelled);
            }
            self.base.dispatch_text_sample(0, Arc::new(cue))?;
        }
        self.base.flush_all_downstreams()
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("00:00:01.000", 1000)]
    #[test_case("00:01:02.500", 62500)]
    #[test_case("01:00:00.001", 3_600_001)]
    #[test_case("02:03.000", 123_000)]
    fn test_parse_timestamp(input: &str, want: i64) {
        assert_eq!(want, parse_timestamp(input).unwrap());
    }

    #[test_case("1.000")]
    #[test_case("00:00:01")]
    #[test_case("00:61:00.000")]
    #[test_case("00:00:01.1")]
    fn test_parse_timestamp_invalid(input: &str) {
        parse_timestamp(input).unwrap_err();
    }

    #[test_case(0, "00:00:00.000")]
    #[test_case(62500, "00:01:02.500")]
    #[test_case(3_600_001, "01:00:00.001")]
    fn test_format_timestamp(ms: i64, want: &str) {
        assert_eq!(want, format_timestamp(ms));
    }

    #[test]
    fn test_parse_cues() {
        let doc = "WEBVTT\n\
                   \n\
                   intro\n\
                   00:00:01.000 --> 00:00:03.000 align:start\n\
                   Hello\n\
                   world\n\
                   \n\
                   NOTE this is ignored\n\
                   \n\
                   00:00:04.000 --> 00:00:05.000\n\
                   Bye\n";
        let cues = parse_cues(doc).unwrap();
        assert_eq!(
            vec![
                TextSample {
                    id: "intro".to_owned(),
                    start_time: 1000,
                    end_time: 3000,
                    settings: "align:start".to_owned(),
                    body: "Hello\nworld".to_owned(),
                },
                TextSample {
                    id: String::new(),
                    start_time: 4000,
                    end_time: 5000,
                    settings: String::new(),
                    body: "Bye".to_owned(),
                },
            ],
            cues
        );
    }

    #[test]
    fn test_parse_missing_header() {
        assert_eq!(
            WebVttError::MissingHeader,
            parse_cues("00:00:01.000 --> 00:00:02.000\nhi\n").unwrap_err()
        );
    }
}
