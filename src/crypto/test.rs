#![allow(clippy::unwrap_used)]

use crate::{
    aes::{AesCbcDecryptor, AesCtrCryptor, CbcIvRule, CbcPadding},
    EncryptionHandler, EncryptionOptions, FixedIvGenerator, RawKeyPair, RawKeyParams,
    RawKeySource,
};
use bytes::Bytes;
use common::{
    new_dummy_msg_logger, AudioDetails, Codec, MediaSample, ProtectionScheme, SegmentInfo,
    StreamData, StreamDetails, StreamInfo, StreamPayload, SubsampleEntry, VideoDetails,
};
use pipeline::{add_handler, initialize, shared, testing::FakeSink, MediaHandler, SharedHandler};
use pretty_assertions::assert_eq;
use std::{collections::HashSet, sync::Arc};
use test_case::test_case;

const TIME_SCALE: u32 = 1000;
const SEGMENT_DURATION: i64 = 1000;

const KEY_ID: [u8; 16] = [
    0xe5, 0x00, 0x7e, 0x6e, 0x9d, 0xcd, 0x5a, 0xc0, //
    0x95, 0x20, 0x2e, 0xd3, 0x75, 0x83, 0x82, 0xcd,
];
const KEY: [u8; 16] = [
    0x6f, 0xc9, 0x6f, 0xe6, 0x28, 0xa2, 0x65, 0xb1, //
    0x3a, 0xed, 0xde, 0xc0, 0xbc, 0x42, 0x1f, 0x4d,
];

fn raw_key_source(iv: Vec<u8>, scheme: ProtectionScheme) -> RawKeySource {
    let mut params = RawKeyParams::default();
    params.key_map.insert(
        String::new(),
        RawKeyPair {
            key_id: KEY_ID.to_vec(),
            key: KEY.to_vec(),
        },
    );
    params.iv = iv;
    RawKeySource::new(
        params,
        &HashSet::new(),
        scheme,
        &FixedIvGenerator::new(vec![0x22; 16]),
    )
    .unwrap()
}

struct Fixture {
    handler: SharedHandler,
    log: pipeline::testing::CaptureLog,
}

fn fixture(options: EncryptionOptions, key_iv: Vec<u8>) -> Fixture {
    let scheme = options.protection_scheme;
    let handler = shared(EncryptionHandler::new(
        options,
        Arc::new(raw_key_source(key_iv, scheme)),
        Arc::new(FixedIvGenerator::new(vec![0x22; 16])),
        new_dummy_msg_logger(),
    ));
    let sink = FakeSink::new();
    let log = sink.log();
    add_handler(&handler, &shared(sink)).unwrap();
    initialize(&handler).unwrap();
    Fixture { handler, log }
}

fn video_stream_info() -> Arc<StreamInfo> {
    Arc::new(StreamInfo {
        codec: Codec::H264,
        time_scale: TIME_SCALE,
        duration: 0,
        codec_config: Bytes::new(),
        codec_string: "avc1.64001e".to_owned(),
        language: "und".to_owned(),
        is_encrypted: false,
        encryption_config: None,
        details: StreamDetails::Video(VideoDetails {
            width: 640,
            height: 360,
            nalu_length_size: 4,
            ..VideoDetails::default()
        }),
    })
}

fn audio_stream_info() -> Arc<StreamInfo> {
    Arc::new(StreamInfo {
        codec: Codec::Aac,
        time_scale: TIME_SCALE,
        duration: 0,
        codec_config: Bytes::new(),
        codec_string: "mp4a.40.2".to_owned(),
        language: "und".to_owned(),
        is_encrypted: false,
        encryption_config: None,
        details: StreamDetails::Audio(AudioDetails {
            sampling_frequency: 44100,
            num_channels: 2,
            sample_bits: 16,
        }),
    })
}

fn process(fixture: &Fixture, data: StreamData) {
    fixture.handler.lock().unwrap().process(data).unwrap();
}

fn audio_sample(dts: i64, len: usize) -> MediaSample {
    let data: Vec<u8> = (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect();
    MediaSample::new(dts, dts, SEGMENT_DURATION, true, data.into())
}

fn video_sample(dts: i64, payload_len: usize) -> MediaSample {
    let mut data = Vec::new();
    data.extend_from_slice(&u32::try_from(payload_len).unwrap().to_be_bytes());
    data.push(0x65);
    for i in 1..payload_len {
        data.push(u8::try_from(i % 251).unwrap());
    }
    MediaSample::new(dts, dts, SEGMENT_DURATION, true, data.into())
}

fn segment_info(start: i64) -> SegmentInfo {
    SegmentInfo {
        start_timestamp: start,
        duration: SEGMENT_DURATION,
        ..SegmentInfo::default()
    }
}

fn captured_stream_info(fixture: &Fixture) -> Arc<StreamInfo> {
    let events = fixture.log.events();
    let StreamPayload::StreamInfo(info) = &events[0].payload else {
        panic!("expected stream info, got {}", events[0].payload.kind_name());
    };
    info.clone()
}

#[test_case(ProtectionScheme::Cenc, true, 0, 0, 8, 0; "cenc video")]
#[test_case(ProtectionScheme::Cbc1, true, 0, 0, 16, 0; "cbc1 video")]
#[test_case(ProtectionScheme::Cens, true, 1, 9, 16, 0; "cens video")]
#[test_case(ProtectionScheme::Cbcs, true, 1, 9, 0, 16; "cbcs video")]
#[test_case(ProtectionScheme::SampleAes, true, 1, 9, 0, 16; "sample aes video")]
#[test_case(ProtectionScheme::Cenc, false, 0, 0, 8, 0; "cenc audio")]
#[test_case(ProtectionScheme::Cbcs, false, 0, 0, 0, 16; "cbcs audio")]
#[test_case(ProtectionScheme::SampleAes, false, 0, 0, 0, 16; "sample aes audio")]
fn test_stream_info_encryption_config(
    scheme: ProtectionScheme,
    video: bool,
    crypt_byte_block: u8,
    skip_byte_block: u8,
    per_sample_iv_size: u8,
    constant_iv_len: usize,
) {
    let fixture = fixture(
        EncryptionOptions {
            protection_scheme: scheme,
            ..EncryptionOptions::default()
        },
        Vec::new(),
    );
    let info = if video {
        video_stream_info()
    } else {
        audio_stream_info()
    };
    process(&fixture, StreamData::from_stream_info(0, info));

    let info = captured_stream_info(&fixture);
    assert!(info.is_encrypted);
    let config = info.encryption_config.as_ref().unwrap();
    assert_eq!(scheme, config.protection_scheme);
    assert_eq!(KEY_ID.to_vec(), config.key_id);
    assert_eq!(crypt_byte_block, config.crypt_byte_block);
    assert_eq!(skip_byte_block, config.skip_byte_block);
    assert_eq!(per_sample_iv_size, config.per_sample_iv_size);
    assert_eq!(constant_iv_len, config.constant_iv.len());
}

#[test]
fn test_clear_lead_rounds_up_to_segment_boundary() {
    let fixture = fixture(
        EncryptionOptions {
            protection_scheme: ProtectionScheme::Cenc,
            clear_lead_in_seconds: 1.5,
            ..EncryptionOptions::default()
        },
        vec![0x11; 8],
    );
    process(&fixture, StreamData::from_stream_info(0, audio_stream_info()));
    fixture.log.clear();

    // Single-sample segments at 0s, 1s and 2s. Only the third starts at or
    // after the clear lead.
    for i in 0..3_i64 {
        let original = audio_sample(i * SEGMENT_DURATION, 10);
        process(&fixture, StreamData::from_media_sample(0, original.clone()));
        process(
            &fixture,
            StreamData::from_segment_info(0, segment_info(i * SEGMENT_DURATION)),
        );

        let encrypted = i == 2;
        let samples = fixture.log.media_samples();
        let sample = samples.last().unwrap();
        let infos = fixture.log.segment_infos();
        let info = infos.last().unwrap();

        assert_eq!(encrypted, info.is_encrypted, "segment {i}");
        assert_eq!(encrypted, sample.decrypt_config.is_some(), "segment {i}");
        if encrypted {
            assert_ne!(original.data, sample.data);
            let config = sample.decrypt_config.as_ref().unwrap();
            assert_eq!(KEY_ID.to_vec(), config.key_id);
            // Audio under cenc is fully encrypted, no subsample list.
            assert!(config.subsamples.is_empty());
        } else {
            assert_eq!(original.data, sample.data);
        }
    }
}

#[test]
fn test_cenc_sample_iv_advances_by_block_count() {
    let iv = vec![0; 16];
    let fixture = fixture(
        EncryptionOptions {
            protection_scheme: ProtectionScheme::Cenc,
            ..EncryptionOptions::default()
        },
        iv.clone(),
    );
    process(&fixture, StreamData::from_stream_info(0, audio_stream_info()));
    fixture.log.clear();

    // 20 bytes consume two blocks, 40 bytes consume three.
    process(&fixture, StreamData::from_media_sample(0, audio_sample(0, 20)));
    process(&fixture, StreamData::from_media_sample(0, audio_sample(10, 40)));
    process(&fixture, StreamData::from_media_sample(0, audio_sample(20, 10)));

    let samples = fixture.log.media_samples();
    let ivs: Vec<Vec<u8>> = samples
        .iter()
        .map(|s| s.decrypt_config.as_ref().unwrap().iv.clone())
        .collect();

    let mut iv2 = [0_u8; 16];
    iv2[15] = 2;
    let mut iv5 = [0_u8; 16];
    iv5[15] = 5;
    assert_eq!(vec![iv, iv2.to_vec(), iv5.to_vec()], ivs);
}

#[test]
fn test_cenc_round_trip() {
    let fixture = fixture(
        EncryptionOptions {
            protection_scheme: ProtectionScheme::Cenc,
            ..EncryptionOptions::default()
        },
        vec![0x11; 8],
    );
    process(&fixture, StreamData::from_stream_info(0, video_stream_info()));
    fixture.log.clear();

    let original = video_sample(0, 100);
    process(&fixture, StreamData::from_media_sample(0, original.clone()));

    let samples = fixture.log.media_samples();
    let encrypted = &samples[0];
    let config = encrypted.decrypt_config.as_ref().unwrap();

    // Subsample spans cover the sample exactly.
    let covered: u32 = config
        .subsamples
        .iter()
        .map(|s| s.clear_bytes + s.cipher_bytes)
        .sum();
    assert_eq!(u32::try_from(original.data.len()).unwrap(), covered);

    // Decrypting the cipher spans under the recorded iv restores the
    // sample byte for byte.
    let mut decryptor = AesCtrCryptor::new(&KEY, &config.iv).unwrap();
    let mut decrypted = Vec::new();
    let mut pos = 0_usize;
    for entry in &config.subsamples {
        let clear_end = pos + usize::try_from(entry.clear_bytes).unwrap();
        decrypted.extend_from_slice(&encrypted.data[pos..clear_end]);
        let cipher_end = clear_end + usize::try_from(entry.cipher_bytes).unwrap();
        decryptor.crypt(&encrypted.data[clear_end..cipher_end], &mut decrypted);
        pos = cipher_end;
    }
    assert_eq!(original.data.to_vec(), decrypted);
}

#[test]
fn test_cbcs_video_pattern() {
    let fixture = fixture(
        EncryptionOptions {
            protection_scheme: ProtectionScheme::Cbcs,
            ..EncryptionOptions::default()
        },
        vec![0x11; 16],
    );
    process(&fixture, StreamData::from_stream_info(0, video_stream_info()));
    fixture.log.clear();

    let original = video_sample(0, 100);
    process(&fixture, StreamData::from_media_sample(0, original.clone()));

    let samples = fixture.log.media_samples();
    let encrypted = &samples[0];
    let config = encrypted.decrypt_config.as_ref().unwrap();
    assert_eq!(1, config.crypt_byte_block);
    assert_eq!(9, config.skip_byte_block);
    assert_eq!(vec![SubsampleEntry::new(36, 68)], config.subsamples);

    // Clear prefix untouched.
    assert_eq!(original.data[..36], encrypted.data[..36]);
    // 1:9 pattern: the first block of the cipher span is encrypted, the
    // next nine (clamped to the span) are not.
    assert_ne!(original.data[36..52], encrypted.data[36..52]);
    assert_eq!(original.data[52..], encrypted.data[52..]);
}

#[test]
fn test_sample_aes_audio() {
    let constant_iv = vec![0x41, 0x54, 0x65, 0x73, 0x74, 0x49, 0x76, 0x33];
    let fixture = fixture(
        EncryptionOptions {
            protection_scheme: ProtectionScheme::SampleAes,
            ..EncryptionOptions::default()
        },
        constant_iv.clone(),
    );
    process(&fixture, StreamData::from_stream_info(0, audio_stream_info()));

    let info = captured_stream_info(&fixture);
    let config = info.encryption_config.as_ref().unwrap();
    assert_eq!(0, config.crypt_byte_block);
    assert_eq!(0, config.skip_byte_block);
    assert_eq!(0, config.per_sample_iv_size);
    assert_eq!(constant_iv, config.constant_iv);
    fixture.log.clear();

    let original = audio_sample(0, 100);
    process(&fixture, StreamData::from_media_sample(0, original.clone()));

    let samples = fixture.log.media_samples();
    let encrypted = &samples[0];
    let decrypt_config = encrypted.decrypt_config.as_ref().unwrap();
    assert_eq!(vec![SubsampleEntry::new(16, 84)], decrypt_config.subsamples);
    // Frame header clear.
    assert_eq!(original.data[..16], encrypted.data[..16]);
    // Whole blocks of the cipher span encrypted, the partial tail clear.
    assert_ne!(original.data[16..96], encrypted.data[16..96]);
    assert_eq!(original.data[96..], encrypted.data[96..]);

    let mut decryptor =
        AesCbcDecryptor::new(&KEY, &constant_iv, CbcPadding::None, CbcIvRule::UseConstantIv)
            .unwrap();
    let mut decrypted = encrypted.data[..16].to_vec();
    decryptor.crypt(&encrypted.data[16..], &mut decrypted).unwrap();
    assert_eq!(original.data.to_vec(), decrypted);
}

#[test]
fn test_key_rotation() {
    let fixture = fixture(
        EncryptionOptions {
            protection_scheme: ProtectionScheme::Cenc,
            crypto_period_duration_in_seconds: 2.0,
            ..EncryptionOptions::default()
        },
        vec![0x11; 8],
    );
    process(&fixture, StreamData::from_stream_info(0, audio_stream_info()));

    // The announced key id is a placeholder; the real ids rotate.
    let info = captured_stream_info(&fixture);
    assert_eq!(vec![0; 16], info.encryption_config.as_ref().unwrap().key_id);
    fixture.log.clear();

    for i in 0..5_i64 {
        process(
            &fixture,
            StreamData::from_media_sample(0, audio_sample(i * SEGMENT_DURATION, 32)),
        );
        process(
            &fixture,
            StreamData::from_segment_info(0, segment_info(i * SEGMENT_DURATION)),
        );
    }

    let samples = fixture.log.media_samples();
    let key_ids: Vec<Vec<u8>> = samples
        .iter()
        .map(|s| s.decrypt_config.as_ref().unwrap().key_id.clone())
        .collect();
    // Two segments per crypto period: five segments span three periods.
    assert_eq!(key_ids[0], key_ids[1]);
    assert_eq!(key_ids[2], key_ids[3]);
    assert_ne!(key_ids[0], key_ids[2]);
    assert_ne!(key_ids[2], key_ids[4]);
    assert_ne!(key_ids[0], key_ids[4]);

    // The first segment of each period announces the rotation.
    let infos = fixture.log.segment_infos();
    let rotations: Vec<bool> = infos
        .iter()
        .map(|info| info.key_rotation_encryption_config.is_some())
        .collect();
    assert_eq!(vec![true, false, true, false, true], rotations);
    assert_eq!(
        key_ids[0],
        infos[0]
            .key_rotation_encryption_config
            .as_ref()
            .unwrap()
            .key_id
    );
}

#[test]
fn test_key_rotation_inside_clear_lead() {
    let fixture = fixture(
        EncryptionOptions {
            protection_scheme: ProtectionScheme::Cenc,
            clear_lead_in_seconds: 1.0,
            crypto_period_duration_in_seconds: 1.0,
            ..EncryptionOptions::default()
        },
        vec![0x11; 8],
    );
    process(&fixture, StreamData::from_stream_info(0, audio_stream_info()));
    fixture.log.clear();

    process(&fixture, StreamData::from_media_sample(0, audio_sample(0, 16)));
    process(&fixture, StreamData::from_segment_info(0, segment_info(0)));

    let samples = fixture.log.media_samples();
    assert!(samples[0].decrypt_config.is_none());
    let infos = fixture.log.segment_infos();
    // Clear segment, but the rotation config still rides along.
    assert!(!infos[0].is_encrypted);
    assert!(infos[0].key_rotation_encryption_config.is_some());
}

#[test]
fn test_text_stream_passes_through() {
    let fixture = fixture(EncryptionOptions::default(), Vec::new());
    let info = Arc::new(StreamInfo {
        codec: Codec::WebVtt,
        time_scale: 1000,
        duration: 0,
        codec_config: Bytes::new(),
        codec_string: "wvtt".to_owned(),
        language: "en".to_owned(),
        is_encrypted: false,
        encryption_config: None,
        details: StreamDetails::Text,
    });
    process(&fixture, StreamData::from_stream_info(0, info));

    let captured = captured_stream_info(&fixture);
    assert!(!captured.is_encrypted);
    assert!(captured.encryption_config.is_none());
}
