//! AV1 temporal-unit walking. Samples are a sequence of OBUs in the low
//! overhead bitstream format (each OBU carries a size field, per
//! https://aomediacodec.github.io/av1-isobmff/#sampleformat).
//!
//! Tiles are reported at tile-group granularity: the payload of every Frame
//! and TileGroup OBU is one encryptable span, with the OBU header and size
//! field clear.

use crate::BitstreamError;
use common::SubsampleEntry;

pub const OBU_SEQUENCE_HEADER: u8 = 1;
pub const OBU_TEMPORAL_DELIMITER: u8 = 2;
pub const OBU_FRAME_HEADER: u8 = 3;
pub const OBU_TILE_GROUP: u8 = 4;
pub const OBU_METADATA: u8 = 5;
pub const OBU_FRAME: u8 = 6;
pub const OBU_PADDING: u8 = 15;

/// One open bitstream unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Obu {
    pub obu_type: u8,
    /// Offset of the OBU header within the sample.
    pub offset: usize,
    /// Header byte + optional extension byte + size field.
    pub header_size: usize,
    pub payload_size: usize,
}

impl Obu {
    #[must_use]
    pub fn size(&self) -> usize {
        self.header_size + self.payload_size
    }

    /// Whether the payload carries coded tile data.
    #[must_use]
    pub fn has_tile_data(&self) -> bool {
        matches!(self.obu_type, OBU_FRAME | OBU_TILE_GROUP)
    }
}

/// Parse a temporal unit into OBUs.
pub fn parse_temporal_unit(data: &[u8]) -> Result<Vec<Obu>, BitstreamError> {
    let mut obus = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let obu = parse_obu(data, pos)?;
        pos += obu.size();
        obus.push(obu);
    }
    Ok(obus)
}

fn parse_obu(data: &[u8], offset: usize) -> Result<Obu, BitstreamError> {
    let header = data[offset];
    if header & 0x80 != 0 {
        return Err(BitstreamError::ObuForbiddenBit);
    }
    let obu_type = (header >> 3) & 0x0f;
    let has_extension = header & 0x04 != 0;
    let has_size_field = header & 0x02 != 0;

    let mut header_size = 1;
    if has_extension {
        header_size += 1;
    }
    if offset + header_size > data.len() {
        return Err(BitstreamError::TruncatedObu(format!("header at {offset}")));
    }

    let payload_size = if has_size_field {
        let (size, size_len) = read_leb128(&data[offset + header_size..])?;
        header_size += size_len;
        size
    } else {
        // Without a size field the OBU extends to the end of the unit.
        data.len() - offset - header_size
    };

    if offset + header_size + payload_size > data.len() {
        return Err(BitstreamError::TruncatedObu(format!(
            "payload of {payload_size} bytes at {offset}"
        )));
    }
    Ok(Obu {
        obu_type,
        offset,
        header_size,
        payload_size,
    })
}

// leb128() from the AV1 spec, capped at 8 bytes.
fn read_leb128(data: &[u8]) -> Result<(usize, usize), BitstreamError> {
    let mut value = 0_u64;
    for (i, &byte) in data.iter().take(8).enumerate() {
        value |= u64::from(byte & 0x7f) << (i * 7);
        if byte & 0x80 == 0 {
            let value = usize::try_from(value).map_err(|_| BitstreamError::InvalidLeb128)?;
            return Ok((value, i + 1));
        }
    }
    Err(BitstreamError::InvalidLeb128)
}

/// Raw `(clear, cipher)` spans for an AV1 sample: tile payloads are cipher,
/// everything else (headers, non-tile OBUs) is clear. Spans are not block
/// aligned. The sum of all spans equals the sample length.
pub fn tile_spans(data: &[u8]) -> Result<Vec<SubsampleEntry>, BitstreamError> {
    let obus = parse_temporal_unit(data)?;

    let mut spans: Vec<SubsampleEntry> = Vec::new();
    let mut pending_clear = 0_usize;
    for obu in &obus {
        if obu.has_tile_data() && obu.payload_size > 0 {
            spans.push(SubsampleEntry::new(
                truncate(pending_clear + obu.header_size),
                truncate(obu.payload_size),
            ));
            pending_clear = 0;
        } else {
            pending_clear += obu.size();
        }
    }
    if pending_clear > 0 {
        spans.push(SubsampleEntry::new(truncate(pending_clear), 0));
    }
    Ok(spans)
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn truncate(v: usize) -> u32 {
    debug_assert!(u32::try_from(v).is_ok());
    v as u32
}
