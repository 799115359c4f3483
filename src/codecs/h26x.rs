//! Clear/cipher span extraction for H.264 and H.265 samples.
//!
//! Every NALU keeps a clear prefix covering the start code or length field,
//! the NALU header, and the slice header region. The prefix length follows
//! the HLS SAMPLE-AES rule of 32 leading clear bytes per video NALU, which
//! is also a safe over-approximation of the slice header for the full-block
//! schemes. Non-video NALUs (parameter sets, SEI) stay entirely clear.

use crate::{
    nalu::{split_nalus, Nalu, NaluFormat},
    BitstreamError,
};
use common::{Codec, SubsampleEntry};

/// Leading bytes of a video slice NALU that stay clear, header included.
pub const NALU_LEADING_CLEAR_BYTES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum H26xVariant {
    H264,
    H265,
}

impl H26xVariant {
    #[must_use]
    pub fn from_codec(codec: Codec) -> Option<Self> {
        match codec {
            Codec::H264 => Some(H26xVariant::H264),
            Codec::H265 => Some(H26xVariant::H265),
            _ => None,
        }
    }

    // ISO/IEC 14496-10 table 7-1 and ISO/IEC 23008-2 table 7-1.
    fn is_video_slice(self, header: u8) -> bool {
        match self {
            H26xVariant::H264 => matches!(header & 0x1f, 1..=5),
            H26xVariant::H265 => (header >> 1) & 0x3f <= 31,
        }
    }
}

/// Split a sample into raw per-NALU `(clear, cipher)` spans. The spans are
/// not block aligned; the subsample generator aligns them per scheme.
/// The sum of all spans always equals the sample length.
pub fn video_slice_spans(
    data: &[u8],
    variant: H26xVariant,
    format: NaluFormat,
) -> Result<Vec<SubsampleEntry>, BitstreamError> {
    let nalus = split_nalus(data, format)?;

    let mut spans = Vec::with_capacity(nalus.len());
    for nalu in &nalus {
        spans.push(nalu_span(nalu, variant));
    }
    Ok(spans)
}

fn nalu_span(nalu: &Nalu, variant: H26xVariant) -> SubsampleEntry {
    let total = nalu.size();
    if !variant.is_video_slice(nalu.header) {
        return SubsampleEntry::new(truncate(total), 0);
    }
    let clear = (nalu.prefix_size + NALU_LEADING_CLEAR_BYTES).min(total);
    SubsampleEntry::new(truncate(clear), truncate(total - clear))
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn truncate(v: usize) -> u32 {
    debug_assert!(u32::try_from(v).is_ok());
    v as u32
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn idr_nalu(payload_len: usize) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&u32::try_from(payload_len).unwrap().to_be_bytes());
        data.push(0x65);
        data.extend(std::iter::repeat(0xaa).take(payload_len - 1));
        data
    }

    #[test]
    fn test_slice_gets_leading_clear_bytes() {
        let data = idr_nalu(100);
        let spans =
            video_slice_spans(&data, H26xVariant::H264, NaluFormat::LengthPrefixed(4)).unwrap();
        // 4-byte length field + 32 leading bytes clear, the rest cipher.
        assert_eq!(vec![SubsampleEntry::new(36, 68)], spans);
    }

    #[test]
    fn test_short_slice_is_all_clear() {
        let data = idr_nalu(10);
        let spans =
            video_slice_spans(&data, H26xVariant::H264, NaluFormat::LengthPrefixed(4)).unwrap();
        assert_eq!(vec![SubsampleEntry::new(14, 0)], spans);
    }

    #[test]
    fn test_non_slice_is_clear() {
        // SEI followed by an IDR slice.
        let mut data = vec![0, 0, 0, 2, 0x06, 0xff];
        data.extend(idr_nalu(60));
        let spans =
            video_slice_spans(&data, H26xVariant::H264, NaluFormat::LengthPrefixed(4)).unwrap();
        assert_eq!(
            vec![SubsampleEntry::new(6, 0), SubsampleEntry::new(36, 28)],
            spans
        );
    }

    #[test]
    fn test_spans_cover_sample() {
        let mut data = vec![0, 0, 0, 3, 0x67, 1, 2];
        data.extend(idr_nalu(77));
        let spans =
            video_slice_spans(&data, H26xVariant::H264, NaluFormat::LengthPrefixed(4)).unwrap();
        let total: u32 = spans.iter().map(|s| s.clear_bytes + s.cipher_bytes).sum();
        assert_eq!(u32::try_from(data.len()).unwrap(), total);
    }

    #[test]
    fn test_h265_slice_header_bytes() {
        // H.265 type is in bits 6..1 of the first header byte. Type 19
        // (IDR_W_RADL) => header 0x26.
        let mut data = vec![0, 0, 0, 50, 0x26];
        data.extend(std::iter::repeat(0xbb).take(49));
        let spans =
            video_slice_spans(&data, H26xVariant::H265, NaluFormat::LengthPrefixed(4)).unwrap();
        assert_eq!(vec![SubsampleEntry::new(36, 18)], spans);
    }

    #[test]
    fn test_h265_non_vcl_clear() {
        // Type 33 (SPS) => header 0x42.
        let data = vec![0, 0, 0, 3, 0x42, 1, 2];
        let spans =
            video_slice_spans(&data, H26xVariant::H265, NaluFormat::LengthPrefixed(4)).unwrap();
        assert_eq!(vec![SubsampleEntry::new(7, 0)], spans);
    }
}
