use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

pub const AES_BLOCK_SIZE: usize = 16;
pub const KEY_ID_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
    Text,
}

/// Picks one elementary stream out of a container: by kind, or by track
/// index within the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamSelector {
    Kind(StreamKind),
    Index(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseStreamSelectorError {
    #[error("invalid stream selector: '{0}'")]
    Invalid(String),
}

impl std::str::FromStr for StreamSelector {
    type Err = ParseStreamSelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(StreamSelector::Kind(StreamKind::Audio)),
            "video" => Ok(StreamSelector::Kind(StreamKind::Video)),
            "text" => Ok(StreamSelector::Kind(StreamKind::Text)),
            other => other
                .parse::<usize>()
                .map(StreamSelector::Index)
                .map_err(|_| ParseStreamSelectorError::Invalid(other.to_owned())),
        }
    }
}

impl StreamKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Text => "text",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
    Av1,
    Vp9,
    Aac,
    Ac3,
    Ec3,
    Dts,
    Opus,
    Vorbis,
    Flac,
    WebVtt,
    Unknown,
}

impl Codec {
    #[must_use]
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            Codec::H264 | Codec::H265 | Codec::Av1 | Codec::Vp9
        )
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            Codec::Aac | Codec::Ac3 | Codec::Ec3 | Codec::Dts | Codec::Opus | Codec::Vorbis
                | Codec::Flac
        )
    }
}

/// ISO/IEC 23001-7 protection scheme, plus the Apple HLS variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProtectionScheme {
    #[default]
    Cenc,
    Cbc1,
    Cens,
    Cbcs,
    /// SAMPLE-AES. Carried with the 'cbca' 4CC internally, never written to
    /// any box.
    SampleAes,
}

impl ProtectionScheme {
    #[must_use]
    pub fn four_cc(&self) -> [u8; 4] {
        match self {
            ProtectionScheme::Cenc => *b"cenc",
            ProtectionScheme::Cbc1 => *b"cbc1",
            ProtectionScheme::Cens => *b"cens",
            ProtectionScheme::Cbcs => *b"cbcs",
            ProtectionScheme::SampleAes => *b"cbca",
        }
    }

    /// Schemes that run AES-CTR under the hood. The others are AES-CBC.
    #[must_use]
    pub fn is_ctr(&self) -> bool {
        matches!(self, ProtectionScheme::Cenc | ProtectionScheme::Cens)
    }

    /// Pattern (crypt:skip) schemes. `cenc` and `cbc1` are full-block.
    #[must_use]
    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            ProtectionScheme::Cens | ProtectionScheme::Cbcs | ProtectionScheme::SampleAes
        )
    }
}

impl fmt::Display for ProtectionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let four_cc = self.four_cc();
        write!(f, "{}", String::from_utf8_lossy(&four_cc))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseProtectionSchemeError {
    #[error("unknown protection scheme: '{0}'")]
    Unknown(String),
}

impl std::str::FromStr for ProtectionScheme {
    type Err = ParseProtectionSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cenc" => Ok(ProtectionScheme::Cenc),
            "cbc1" => Ok(ProtectionScheme::Cbc1),
            "cens" => Ok(ProtectionScheme::Cens),
            "cbcs" => Ok(ProtectionScheme::Cbcs),
            "cbca" | "sample-aes" => Ok(ProtectionScheme::SampleAes),
            _ => Err(ParseProtectionSchemeError::Unknown(s.to_owned())),
        }
    }
}

impl<'de> Deserialize<'de> for ProtectionScheme {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// DRM systems a package can carry initialization data for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtectionSystem {
    CommonSystem,
    Widevine,
    PlayReady,
    FairPlay,
    Marlin,
}

impl ProtectionSystem {
    /// Well-known 16-byte system id.
    #[must_use]
    pub fn system_id(&self) -> [u8; 16] {
        match self {
            ProtectionSystem::CommonSystem => [
                0x10, 0x77, 0xef, 0xec, 0xc0, 0xb2, 0x4d, 0x02, //
                0xac, 0xe3, 0x3c, 0x1e, 0x52, 0xe2, 0xfb, 0x4b,
            ],
            ProtectionSystem::Widevine => [
                0xed, 0xef, 0x8b, 0xa9, 0x79, 0xd6, 0x4a, 0xce, //
                0xa3, 0xc8, 0x27, 0xdc, 0xd5, 0x1d, 0x21, 0xed,
            ],
            ProtectionSystem::PlayReady => [
                0x9a, 0x04, 0xf0, 0x79, 0x98, 0x40, 0x42, 0x86, //
                0xab, 0x92, 0xe6, 0x5b, 0xe0, 0x88, 0x5f, 0x95,
            ],
            ProtectionSystem::FairPlay => [
                0x94, 0xce, 0x86, 0xfb, 0x07, 0xff, 0x4f, 0x43, //
                0xad, 0xb8, 0x93, 0xd2, 0xfa, 0x96, 0x8c, 0xa2,
            ],
            ProtectionSystem::Marlin => [
                0x5e, 0x62, 0x9a, 0xf5, 0x38, 0xda, 0x40, 0x63, //
                0x89, 0x77, 0x97, 0xff, 0xbd, 0x99, 0x02, 0xd4,
            ],
        }
    }
}

/// Protection-system-specific initialization record, i.e. the payload of one
/// 'pssh' box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySystemInfo {
    pub system_id: [u8; 16],
    /// Complete serialized 'pssh' box.
    pub pssh_box: Vec<u8>,
}

/// Per-track encryption parameters, attached to an encrypted `StreamInfo` and
/// to rotated `SegmentInfo`s.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptionConfig {
    pub protection_scheme: ProtectionScheme,
    pub key_id: Vec<u8>,
    /// 0 means the constant iv is used for every sample.
    pub per_sample_iv_size: u8,
    pub constant_iv: Vec<u8>,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
    pub key_system_info: Vec<KeySystemInfo>,
}

/// One `(clear, cipher)` byte-range pair within an encrypted sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubsampleEntry {
    pub clear_bytes: u32,
    pub cipher_bytes: u32,
}

impl SubsampleEntry {
    #[must_use]
    pub fn new(clear_bytes: u32, cipher_bytes: u32) -> Self {
        Self {
            clear_bytes,
            cipher_bytes,
        }
    }
}

/// Everything a decryptor needs to undo the encryption of one sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptConfig {
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    /// Empty means the sample is fully encrypted.
    pub subsamples: Vec<SubsampleEntry>,
    pub protection_scheme: ProtectionScheme,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
}

/// Content key as served by a key source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptionKey {
    pub key_id: Vec<u8>,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub key_system_info: Vec<KeySystemInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoDetails {
    pub width: u32,
    pub height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub transfer_characteristics: u8,
    /// Size in bytes of the NALU length field for length-prefixed samples.
    /// 0 for codecs without NALUs.
    pub nalu_length_size: u8,
}

impl Default for VideoDetails {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            pixel_width: 1,
            pixel_height: 1,
            transfer_characteristics: 0,
            nalu_length_size: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioDetails {
    pub sampling_frequency: u32,
    pub num_channels: u8,
    pub sample_bits: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamDetails {
    Video(VideoDetails),
    Audio(AudioDetails),
    Text,
}

/// Description of one elementary stream. Created by a demuxer and replaced at
/// most once per stream, by the encryption handler flipping `is_encrypted`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub codec: Codec,
    /// Ticks per second. Always positive.
    pub time_scale: u32,
    /// Duration in time-scale ticks. 0 if unknown.
    pub duration: i64,
    /// Opaque decoder configuration, e.g. an AVCDecoderConfigurationRecord.
    pub codec_config: Bytes,
    /// RFC 6381 codec string.
    pub codec_string: String,
    pub language: String,
    pub is_encrypted: bool,
    pub encryption_config: Option<EncryptionConfig>,
    pub details: StreamDetails,
}

impl StreamInfo {
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        match self.details {
            StreamDetails::Video(_) => StreamKind::Video,
            StreamDetails::Audio(_) => StreamKind::Audio,
            StreamDetails::Text => StreamKind::Text,
        }
    }

    #[must_use]
    pub fn video(&self) -> Option<&VideoDetails> {
        match &self.details {
            StreamDetails::Video(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn audio(&self) -> Option<&AudioDetails> {
        match &self.details {
            StreamDetails::Audio(a) => Some(a),
            _ => None,
        }
    }
}
