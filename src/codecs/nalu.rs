//! NALU boundary scanning for H.264/H.265, in both the Annex B byte-stream
//! form (ISO/IEC 14496-10 Annex B start codes) and the length-prefixed form
//! used inside ISO-BMFF samples.

use crate::BitstreamError;

/// One NAL unit located inside a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nalu {
    /// Offset of the start code or length field within the sample.
    pub offset: usize,
    /// Length of the start code or length field.
    pub prefix_size: usize,
    /// Length of the NALU itself, header included.
    pub payload_size: usize,
    /// First byte of the NALU header.
    pub header: u8,
}

impl Nalu {
    /// Total span including the prefix.
    #[must_use]
    pub fn size(&self) -> usize {
        self.prefix_size + self.payload_size
    }
}

/// How NALUs are delimited within a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NaluFormat {
    AnnexB,
    /// Each NALU is preceded by a big-endian length field of 1, 2 or 4
    /// bytes.
    LengthPrefixed(u8),
}

/// Split a sample into NAL units.
pub fn split_nalus(data: &[u8], format: NaluFormat) -> Result<Vec<Nalu>, BitstreamError> {
    match format {
        NaluFormat::AnnexB => split_annex_b(data),
        NaluFormat::LengthPrefixed(length_size) => split_length_prefixed(data, length_size),
    }
}

fn split_length_prefixed(data: &[u8], length_size: u8) -> Result<Vec<Nalu>, BitstreamError> {
    if !matches!(length_size, 1 | 2 | 4) {
        return Err(BitstreamError::InvalidNaluLengthSize(length_size));
    }
    let length_size = usize::from(length_size);

    let mut nalus = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if pos + length_size > data.len() {
            return Err(BitstreamError::TruncatedNalu(format!(
                "length field at {pos}"
            )));
        }
        let mut payload_size = 0_usize;
        for &b in &data[pos..pos + length_size] {
            payload_size = (payload_size << 8) | usize::from(b);
        }
        let payload_start = pos + length_size;
        if payload_size == 0 || payload_start + payload_size > data.len() {
            return Err(BitstreamError::TruncatedNalu(format!(
                "payload of {payload_size} bytes at {payload_start}"
            )));
        }
        nalus.push(Nalu {
            offset: pos,
            prefix_size: length_size,
            payload_size,
            header: data[payload_start],
        });
        pos = payload_start + payload_size;
    }
    Ok(nalus)
}

// ISO/IEC 14496-10 section B.2: a NALU runs from after a 3-byte start code
// to the next start code. Leading zero bytes before a start code belong to
// the previous NALU's prefix region and are kept clear with it.
fn split_annex_b(data: &[u8]) -> Result<Vec<Nalu>, BitstreamError> {
    let Some(first) = find_start_code(data, 0) else {
        return Err(BitstreamError::InvalidStartCode);
    };
    if first.0 != 0 {
        return Err(BitstreamError::InvalidStartCode);
    }

    let mut nalus = Vec::new();
    let mut prefix_start = first.0;
    let mut payload_start = first.1;
    loop {
        let (next_prefix, next_payload) = match find_start_code(data, payload_start) {
            Some(v) => v,
            None => (data.len(), data.len()),
        };
        if payload_start == next_prefix {
            return Err(BitstreamError::TruncatedNalu(format!(
                "empty nalu at {prefix_start}"
            )));
        }
        nalus.push(Nalu {
            offset: prefix_start,
            prefix_size: payload_start - prefix_start,
            payload_size: next_prefix - payload_start,
            header: data[payload_start],
        });
        if next_payload == data.len() {
            break;
        }
        prefix_start = next_prefix;
        payload_start = next_payload;
    }
    Ok(nalus)
}

// Returns (offset of the first zero of the start code, offset just past it).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, i + 3));
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, i + 4));
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_length_prefixed() {
        let data = [
            0, 0, 0, 2, 0x65, 0xaa, // IDR slice.
            0, 0, 0, 3, 0x06, 0xbb, 0xcc, // SEI.
        ];
        let nalus = split_nalus(&data, NaluFormat::LengthPrefixed(4)).unwrap();
        assert_eq!(
            vec![
                Nalu {
                    offset: 0,
                    prefix_size: 4,
                    payload_size: 2,
                    header: 0x65,
                },
                Nalu {
                    offset: 6,
                    prefix_size: 4,
                    payload_size: 3,
                    header: 0x06,
                },
            ],
            nalus
        );
    }

    #[test_case(3; "three byte length")]
    #[test_case(0; "zero length")]
    fn test_invalid_length_size(length_size: u8) {
        split_nalus(&[0, 1, 2], NaluFormat::LengthPrefixed(length_size)).unwrap_err();
    }

    #[test]
    fn test_length_prefixed_truncated() {
        let data = [0, 0, 0, 9, 0x65, 0xaa];
        split_nalus(&data, NaluFormat::LengthPrefixed(4)).unwrap_err();
    }

    #[test]
    fn test_annex_b() {
        let data = [
            0, 0, 0, 1, 0x67, 0x42, // SPS, 4-byte start code.
            0, 0, 1, 0x68, 0xce, // PPS, 3-byte start code.
            0, 0, 1, 0x65, 0x88, 0x80, // IDR slice.
        ];
        let nalus = split_nalus(&data, NaluFormat::AnnexB).unwrap();
        assert_eq!(
            vec![
                Nalu {
                    offset: 0,
                    prefix_size: 4,
                    payload_size: 2,
                    header: 0x67,
                },
                Nalu {
                    offset: 6,
                    prefix_size: 3,
                    payload_size: 2,
                    header: 0x68,
                },
                Nalu {
                    offset: 11,
                    prefix_size: 3,
                    payload_size: 3,
                    header: 0x65,
                },
            ],
            nalus
        );
    }

    #[test]
    fn test_annex_b_no_start_code() {
        split_nalus(&[0x65, 0x88], NaluFormat::AnnexB).unwrap_err();
    }

    #[test]
    fn test_annex_b_sizes_cover_sample() {
        let data = [0, 0, 1, 0x65, 1, 2, 3, 0, 0, 1, 0x06, 9];
        let nalus = split_nalus(&data, NaluFormat::AnnexB).unwrap();
        let total: usize = nalus.iter().map(Nalu::size).sum();
        assert_eq!(data.len(), total);
    }
}
