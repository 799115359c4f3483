use codecs::{
    av1,
    h26x::{self, H26xVariant},
    nalu::NaluFormat,
    vp9, BitstreamError,
};
use common::{Codec, ProtectionScheme, StreamInfo, SubsampleEntry, AES_BLOCK_SIZE};
use thiserror::Error;

/// Leading clear bytes of an audio frame under SAMPLE-AES.
const SAMPLE_AES_AUDIO_CLEAR_BYTES: u32 = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubsampleError {
    #[error("bitstream: {0}")]
    Bitstream(#[from] BitstreamError),

    #[error("subsample layout does not cover the sample: {got} of {want} bytes")]
    BadCoverage { got: u64, want: u64 },
}

/// Computes the `(clear, cipher)` layout the cryptor must respect for one
/// sample, per codec and protection scheme. Stateless; may be shared.
pub struct SubsampleGenerator {
    vp9_subsample_encryption: bool,
}

impl SubsampleGenerator {
    #[must_use]
    pub fn new(vp9_subsample_encryption: bool) -> Self {
        Self {
            vp9_subsample_encryption,
        }
    }

    /// An empty result means the caller encrypts the entire sample.
    /// Otherwise the spans sum to exactly the sample length.
    pub fn subsamples(
        &self,
        info: &StreamInfo,
        scheme: ProtectionScheme,
        data: &[u8],
    ) -> Result<Vec<SubsampleEntry>, SubsampleError> {
        let spans = self.raw_spans(info, scheme, data)?;
        let spans = if scheme.is_pattern() {
            // Pattern schemes leave block alignment to the cryptor.
            spans
        } else {
            align_cipher_to_blocks(spans)
        };
        verify_coverage(&spans, data.len())?;
        Ok(spans)
    }

    fn raw_spans(
        &self,
        info: &StreamInfo,
        scheme: ProtectionScheme,
        data: &[u8],
    ) -> Result<Vec<SubsampleEntry>, SubsampleError> {
        match info.codec {
            Codec::H264 | Codec::H265 => {
                let variant =
                    H26xVariant::from_codec(info.codec).expect("codec is h264 or h265");
                let format = match info.video().map_or(0, |v| v.nalu_length_size) {
                    0 => NaluFormat::AnnexB,
                    n => NaluFormat::LengthPrefixed(n),
                };
                Ok(h26x::video_slice_spans(data, variant, format)?)
            }
            Codec::Av1 => Ok(av1::tile_spans(data)?),
            Codec::Vp9 => {
                if self.vp9_subsample_encryption && !scheme.is_pattern() {
                    Ok(vp9::frame_spans(data)?)
                } else {
                    // Full sample.
                    Ok(Vec::new())
                }
            }
            _ => {
                if scheme == ProtectionScheme::SampleAes {
                    Ok(sample_aes_audio_spans(data))
                } else {
                    // Full sample.
                    Ok(Vec::new())
                }
            }
        }
    }
}

// The frame header stays clear; the remainder is the cipher span, of which
// the CBC cryptor encrypts whole blocks only.
fn sample_aes_audio_spans(data: &[u8]) -> Vec<SubsampleEntry> {
    let len = truncate(data.len());
    if len <= SAMPLE_AES_AUDIO_CLEAR_BYTES {
        return vec![SubsampleEntry::new(len, 0)];
    }
    vec![SubsampleEntry::new(
        SAMPLE_AES_AUDIO_CLEAR_BYTES,
        len - SAMPLE_AES_AUDIO_CLEAR_BYTES,
    )]
}

/// Round every cipher span down to a multiple of the AES block size; the
/// remainder moves into the next span's clear prefix, or a trailing clear
/// entry at the end of the sample.
#[must_use]
pub fn align_cipher_to_blocks(spans: Vec<SubsampleEntry>) -> Vec<SubsampleEntry> {
    let block = truncate(AES_BLOCK_SIZE);
    let mut out = Vec::with_capacity(spans.len() + 1);
    let mut carried_clear = 0;
    for span in spans {
        let aligned = span.cipher_bytes / block * block;
        let remainder = span.cipher_bytes - aligned;
        out.push(SubsampleEntry::new(carried_clear + span.clear_bytes, aligned));
        carried_clear = remainder;
    }
    if carried_clear > 0 {
        out.push(SubsampleEntry::new(carried_clear, 0));
    }
    out
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn truncate(v: usize) -> u32 {
    debug_assert!(u32::try_from(v).is_ok());
    v as u32
}

fn verify_coverage(spans: &[SubsampleEntry], sample_len: usize) -> Result<(), SubsampleError> {
    if spans.is_empty() {
        return Ok(());
    }
    let got: u64 = spans
        .iter()
        .map(|s| u64::from(s.clear_bytes) + u64::from(s.cipher_bytes))
        .sum();
    let want = sample_len.try_into().unwrap_or(u64::MAX);
    if got == want {
        Ok(())
    } else {
        Err(SubsampleError::BadCoverage { got, want })
    }
}
