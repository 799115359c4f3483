// SPDX-License-Identifier: GPL-2.0-or-later

//! Bitstream parsing needed by the encryption path: NALU, OBU and superframe
//! boundary extraction. These parsers never decode; they only locate the
//! byte ranges a cryptor must leave clear.

pub mod av1;
pub mod h26x;
pub mod nalu;
pub mod vp9;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("truncated nalu: {0}")]
    TruncatedNalu(String),

    #[error("invalid start code")]
    InvalidStartCode,

    #[error("invalid nalu length size: {0}")]
    InvalidNaluLengthSize(u8),

    #[error("truncated obu: {0}")]
    TruncatedObu(String),

    #[error("invalid leb128")]
    InvalidLeb128,

    #[error("forbidden bit set in obu header")]
    ObuForbiddenBit,

    #[error("invalid superframe index")]
    InvalidSuperframeIndex,
}
