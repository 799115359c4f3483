//! TOML configuration parsing into packaging parameters and stream
//! descriptors. Key material is hex encoded in config files.

use crate::{
    ContainerFormat, EncryptionParams, HlsParams, HlsPlaylistType, KeyProvider, Mp4OutputParams,
    MpdParams, PackagingParams, StreamDescriptor,
};
use chunking::{AdCuePosition, AdCueGeneratorParams, ChunkingParams};
use common::{ProtectionScheme, ProtectionSystem, StreamSelector};
use crypto::{RawKeyPair, RawKeyParams};
use serde::Deserialize;
use std::{collections::BTreeMap, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid hex in '{0}'")]
    InvalidHex(String),

    #[error("unknown protection system: '{0}'")]
    UnknownProtectionSystem(String),

    #[error("unknown key provider: '{0}'")]
    UnknownKeyProvider(String),

    #[error("unknown output format: '{0}'")]
    UnknownOutputFormat(String),

    #[error("invalid stream selector: '{0}'")]
    InvalidStreamSelector(String),
}

pub fn load_file(path: &std::path::Path) -> Result<(PackagingParams, Vec<StreamDescriptor>), ConfigError> {
    let text = std::fs::read_to_string(path)?;
    load_str(&text)
}

pub fn load_str(text: &str) -> Result<(PackagingParams, Vec<StreamDescriptor>), ConfigError> {
    let config: RootConfig = toml::from_str(text)?;
    config.into_params()
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ConfigError> {
    let invalid = || ConfigError::InvalidHex(s.to_owned());
    if s.len() % 2 != 0 {
        return Err(invalid());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| invalid()))
        .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RootConfig {
    #[serde(default)]
    single_threaded: bool,
    chunking: ChunkingConfig,
    #[serde(default)]
    encryption: Option<EncryptionConfig>,
    #[serde(default)]
    mp4_output: Mp4OutputConfig,
    #[serde(default)]
    hls: HlsConfig,
    #[serde(default)]
    mpd: MpdConfig,
    #[serde(default)]
    ad_cues: Vec<AdCueConfig>,
    #[serde(default)]
    streams: Vec<StreamConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChunkingConfig {
    segment_duration_in_seconds: f64,
    #[serde(default)]
    subsegment_duration_in_seconds: f64,
    #[serde(default = "default_true")]
    segment_sap_aligned: bool,
    #[serde(default = "default_true")]
    subsegment_sap_aligned: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EncryptionConfig {
    key_provider: String,
    #[serde(default)]
    protection_scheme: Option<ProtectionScheme>,
    #[serde(default)]
    clear_lead_in_seconds: f64,
    #[serde(default)]
    crypto_period_duration_in_seconds: f64,
    #[serde(default = "default_true")]
    vp9_subsample_encryption: bool,
    #[serde(default)]
    protection_systems: Vec<String>,
    #[serde(default)]
    raw_key: Option<RawKeyConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawKeyConfig {
    #[serde(default)]
    iv: String,
    #[serde(default)]
    pssh: String,
    #[serde(default)]
    keys: Vec<RawKeyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawKeyEntry {
    #[serde(default)]
    label: String,
    key_id: String,
    key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Mp4OutputConfig {
    #[serde(default)]
    generate_sidx_in_media_segments: bool,
    #[serde(default = "default_true")]
    include_pssh_in_stream: bool,
    #[serde(default)]
    low_latency_dash_mode: bool,
    #[serde(default = "default_sequence_number")]
    initial_sequence_number: u32,
}

fn default_sequence_number() -> u32 {
    1
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HlsConfig {
    #[serde(default)]
    playlist_type: Option<String>,
    #[serde(default)]
    master_playlist_output: Option<PathBuf>,
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    key_uri: String,
    #[serde(default)]
    time_shift_buffer_depth: f64,
    #[serde(default)]
    default_language: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MpdConfig {
    #[serde(default)]
    mpd_output: Option<PathBuf>,
    #[serde(default)]
    base_urls: Vec<String>,
    #[serde(default)]
    min_buffer_time: f64,
    #[serde(default)]
    time_shift_buffer_depth: f64,
    #[serde(default)]
    suggested_presentation_delay: f64,
    #[serde(default)]
    minimum_update_period: f64,
    #[serde(default)]
    default_language: String,
    #[serde(default)]
    generate_static_live_mpd: bool,
    #[serde(default)]
    generate_dash_if_iop_compliant_mpd: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdCueConfig {
    start_time_in_seconds: f64,
    #[serde(default)]
    duration_in_seconds: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StreamConfig {
    input: PathBuf,
    stream_selector: String,
    #[serde(default)]
    output: Option<PathBuf>,
    #[serde(default)]
    segment_template: Option<String>,
    #[serde(default)]
    init_segment: Option<PathBuf>,
    #[serde(default)]
    output_format: Option<String>,
    #[serde(default)]
    skip_encryption: bool,
    #[serde(default)]
    drm_label: Option<String>,
    #[serde(default)]
    trick_play_factor: u32,
    #[serde(default)]
    bandwidth: u64,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    hls_name: Option<String>,
    #[serde(default)]
    hls_group_id: Option<String>,
    #[serde(default)]
    hls_playlist_name: Option<String>,
    #[serde(default)]
    hls_iframe_playlist_name: Option<String>,
    #[serde(default)]
    hls_characteristics: Vec<String>,
    #[serde(default)]
    dash_accessibilities: Vec<String>,
    #[serde(default)]
    dash_roles: Vec<String>,
    #[serde(default)]
    dash_label: Option<String>,
    #[serde(default)]
    dash_only: bool,
    #[serde(default)]
    hls_only: bool,
}

impl RootConfig {
    fn into_params(self) -> Result<(PackagingParams, Vec<StreamDescriptor>), ConfigError> {
        let encryption = match self.encryption {
            Some(config) => parse_encryption(config)?,
            None => EncryptionParams::default(),
        };

        let params = PackagingParams {
            chunking: ChunkingParams {
                segment_duration_in_seconds: self.chunking.segment_duration_in_seconds,
                subsegment_duration_in_seconds: self.chunking.subsegment_duration_in_seconds,
                segment_sap_aligned: self.chunking.segment_sap_aligned,
                subsegment_sap_aligned: self.chunking.subsegment_sap_aligned,
            },
            encryption,
            mp4_output: Mp4OutputParams {
                generate_sidx_in_media_segments: self.mp4_output.generate_sidx_in_media_segments,
                include_pssh_in_stream: self.mp4_output.include_pssh_in_stream,
                low_latency_dash_mode: self.mp4_output.low_latency_dash_mode,
                initial_sequence_number: self.mp4_output.initial_sequence_number,
            },
            hls: HlsParams {
                playlist_type: match self.hls.playlist_type.as_deref() {
                    None | Some("vod") => HlsPlaylistType::Vod,
                    Some("event") => HlsPlaylistType::Event,
                    Some("live") => HlsPlaylistType::Live,
                    Some(other) => {
                        return Err(ConfigError::UnknownOutputFormat(other.to_owned()))
                    }
                },
                master_playlist_output: self.hls.master_playlist_output,
                base_url: self.hls.base_url,
                key_uri: self.hls.key_uri,
                time_shift_buffer_depth: self.hls.time_shift_buffer_depth,
                default_language: self.hls.default_language,
            },
            mpd: MpdParams {
                mpd_output: self.mpd.mpd_output,
                base_urls: self.mpd.base_urls,
                min_buffer_time: self.mpd.min_buffer_time,
                time_shift_buffer_depth: self.mpd.time_shift_buffer_depth,
                suggested_presentation_delay: self.mpd.suggested_presentation_delay,
                minimum_update_period: self.mpd.minimum_update_period,
                default_language: self.mpd.default_language,
                generate_static_live_mpd: self.mpd.generate_static_live_mpd,
                generate_dash_if_iop_compliant_mpd: self
                    .mpd
                    .generate_dash_if_iop_compliant_mpd,
            },
            ad_cues: AdCueGeneratorParams {
                cue_points: self
                    .ad_cues
                    .into_iter()
                    .map(|cue| AdCuePosition {
                        start_time_in_seconds: cue.start_time_in_seconds,
                        duration_in_seconds: cue.duration_in_seconds,
                    })
                    .collect(),
            },
            single_threaded: self.single_threaded,
        };

        let mut descriptors = Vec::with_capacity(self.streams.len());
        for stream in self.streams {
            descriptors.push(parse_stream(stream)?);
        }
        Ok((params, descriptors))
    }
}

fn parse_encryption(config: EncryptionConfig) -> Result<EncryptionParams, ConfigError> {
    let key_provider = match config.key_provider.as_str() {
        "none" => KeyProvider::None,
        "widevine" => KeyProvider::Widevine,
        "playready" => KeyProvider::PlayReady,
        "raw_key" => KeyProvider::RawKey,
        other => return Err(ConfigError::UnknownKeyProvider(other.to_owned())),
    };

    let mut protection_systems = std::collections::HashSet::new();
    for system in &config.protection_systems {
        protection_systems.insert(match system.as_str() {
            "common" => ProtectionSystem::CommonSystem,
            "widevine" => ProtectionSystem::Widevine,
            "playready" => ProtectionSystem::PlayReady,
            "fairplay" => ProtectionSystem::FairPlay,
            "marlin" => ProtectionSystem::Marlin,
            other => return Err(ConfigError::UnknownProtectionSystem(other.to_owned())),
        });
    }

    let raw_key = match config.raw_key {
        Some(raw) => {
            let mut key_map = BTreeMap::new();
            for entry in raw.keys {
                key_map.insert(
                    entry.label,
                    RawKeyPair {
                        key_id: decode_hex(&entry.key_id)?,
                        key: decode_hex(&entry.key)?,
                    },
                );
            }
            RawKeyParams {
                key_map,
                iv: decode_hex(&raw.iv)?,
                pssh: decode_hex(&raw.pssh)?,
            }
        }
        None => RawKeyParams::default(),
    };

    Ok(EncryptionParams {
        key_provider,
        raw_key,
        widevine: crypto::WidevineKeyServerParams::default(),
        playready: crypto::PlayReadyKeyServerParams::default(),
        protection_scheme: config.protection_scheme.unwrap_or_default(),
        clear_lead_in_seconds: config.clear_lead_in_seconds,
        crypto_period_duration_in_seconds: config.crypto_period_duration_in_seconds,
        vp9_subsample_encryption: config.vp9_subsample_encryption,
        protection_systems,
    })
}

fn parse_stream(config: StreamConfig) -> Result<StreamDescriptor, ConfigError> {
    let selector: StreamSelector = config
        .stream_selector
        .parse()
        .map_err(|_| ConfigError::InvalidStreamSelector(config.stream_selector.clone()))?;
    let output_format = match config.output_format.as_deref() {
        None => None,
        Some("mp4") => Some(ContainerFormat::Mp4),
        Some("ts") => Some(ContainerFormat::Ts),
        Some("vtt" | "webvtt") => Some(ContainerFormat::WebVtt),
        Some(other) => return Err(ConfigError::UnknownOutputFormat(other.to_owned())),
    };

    let mut descriptor = StreamDescriptor::new(config.input, selector);
    descriptor.output = config.output;
    descriptor.segment_template = config.segment_template;
    descriptor.init_segment = config.init_segment;
    descriptor.output_format = output_format;
    descriptor.skip_encryption = config.skip_encryption;
    descriptor.drm_label = config.drm_label;
    descriptor.trick_play_factor = config.trick_play_factor;
    descriptor.bandwidth = config.bandwidth;
    descriptor.language = config.language;
    descriptor.hls_name = config.hls_name;
    descriptor.hls_group_id = config.hls_group_id;
    descriptor.hls_playlist_name = config.hls_playlist_name;
    descriptor.hls_iframe_playlist_name = config.hls_iframe_playlist_name;
    descriptor.hls_characteristics = config.hls_characteristics;
    descriptor.dash_accessibilities = config.dash_accessibilities;
    descriptor.dash_roles = config.dash_roles;
    descriptor.dash_label = config.dash_label;
    descriptor.dash_only = config.dash_only;
    descriptor.hls_only = config.hls_only;
    Ok(descriptor)
}
