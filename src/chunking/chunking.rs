// SPDX-License-Identifier: GPL-2.0-or-later

//! Segmentation: inserting `SegmentInfo` boundaries into continuous sample
//! streams, and converting ad markers into the cue events that force them.

mod chunker;
mod cue;

pub use chunker::*;
pub use cue::*;

use common::PipelineError;

/// Segmentation parameters.
#[derive(Clone, Debug)]
pub struct ChunkingParams {
    /// Target segment duration in seconds. Actual durations differ when
    /// cuts wait for stream access points.
    pub segment_duration_in_seconds: f64,
    /// Subsegment duration in seconds, 0 to disable subsegments. Must not
    /// exceed the segment duration.
    pub subsegment_duration_in_seconds: f64,
    /// Only cut segments on key frames.
    pub segment_sap_aligned: bool,
    /// Only cut subsegments on key frames. Requires `segment_sap_aligned`.
    pub subsegment_sap_aligned: bool,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            segment_duration_in_seconds: 0.0,
            subsegment_duration_in_seconds: 0.0,
            segment_sap_aligned: true,
            subsegment_sap_aligned: true,
        }
    }
}

impl ChunkingParams {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.segment_duration_in_seconds <= 0.0 {
            return Err(PipelineError::InvalidArgument(
                "segment duration must be positive".to_owned(),
            ));
        }
        if self.subsegment_duration_in_seconds > self.segment_duration_in_seconds {
            return Err(PipelineError::InvalidArgument(
                "subsegment duration must not exceed the segment duration".to_owned(),
            ));
        }
        if self.subsegment_sap_aligned && !self.segment_sap_aligned {
            return Err(PipelineError::InvalidArgument(
                "subsegments cannot be sap aligned without sap aligned segments".to_owned(),
            ));
        }
        Ok(())
    }
}
