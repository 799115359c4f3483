#![allow(clippy::unwrap_used, clippy::cast_possible_truncation, clippy::as_conversions)]

use crate::{
    exit_code, run_packager, EncryptionParams, KeyProvider, PackagingParams, RuntimeDeps,
    StreamDescriptor, VodMediaInfoLog,
};
use chunking::ChunkingParams;
use common::{new_dummy_msg_logger, ProtectionScheme, StreamKind, StreamSelector, ZeroClock};
use crypto::{FixedIvGenerator, RawKeyPair, RawKeyParams};
use mp4::{
    pack_language, AudioSampleEntry, Boxes, Ftyp, FullBox, Hdlr, Mdat, Mdhd, Mdia, Minf, Moov,
    Mvhd, RawBox, Stbl, Stsd, Tkhd, Trak, VisualSampleEntry,
};
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, path::Path, sync::Arc};

const KEY_ID: [u8; 16] = [
    0xe5, 0x00, 0x7e, 0x6e, 0x9d, 0xcd, 0x5a, 0xc0, //
    0x95, 0x20, 0x2e, 0xd3, 0x75, 0x83, 0x82, 0xcd,
];
const KEY: [u8; 16] = [
    0x6f, 0xc9, 0x6f, 0xe6, 0x28, 0xa2, 0x65, 0xb1, //
    0x3a, 0xed, 0xde, 0xc0, 0xbc, 0x42, 0x1f, 0x4d,
];

const TIME_SCALE: u32 = 1000;
const SAMPLE_COUNT: u32 = 12;
const SAMPLE_DELTA: u32 = 228;
const TOTAL_DURATION: i64 = 2736;

struct TrackSpec {
    kind: StreamKind,
    sample_size: u32,
}

fn full_table(typ: &[u8; 4], words: &[u32]) -> Boxes {
    let mut data = vec![0, 0, 0, 0];
    for word in words {
        data.extend_from_slice(&word.to_be_bytes());
    }
    Boxes::new(RawBox { typ: *typ, data })
}

fn track_boxes(spec: &TrackSpec, track_id: u32, chunk_offset: u32) -> Boxes {
    let entry = match spec.kind {
        StreamKind::Video => Boxes::new(VisualSampleEntry {
            typ: *b"avc1",
            data_reference_index: 1,
            width: 640,
            height: 360,
        })
        .with_child(Boxes::new(RawBox {
            typ: *b"avcC",
            data: vec![1, 0x64, 0x00, 0x1e, 0xff, 0xe1],
        })),
        _ => Boxes::new(AudioSampleEntry {
            typ: *b"mp4a",
            data_reference_index: 1,
            channel_count: 2,
            sample_size: 16,
            sample_rate: 44100 << 16,
        })
        .with_child(Boxes::new(RawBox {
            typ: *b"esds",
            data: vec![0, 0, 0, 0],
        })),
    };

    let stbl = Boxes::new(Stbl)
        .with_child(
            Boxes::new(Stsd {
                full_box: FullBox::default(),
                entry_count: 1,
            })
            .with_child(entry),
        )
        .with_children(vec![
            full_table(b"stts", &[1, SAMPLE_COUNT, SAMPLE_DELTA]),
            full_table(b"stsc", &[1, 1, SAMPLE_COUNT, 1]),
            {
                let mut words = vec![0, SAMPLE_COUNT];
                words.extend(std::iter::repeat(spec.sample_size).take(SAMPLE_COUNT as usize));
                full_table(b"stsz", &words)
            },
            full_table(b"stco", &[1, chunk_offset]),
        ]);

    let handler = match spec.kind {
        StreamKind::Video => Hdlr::video(),
        _ => Hdlr::audio(),
    };

    Boxes::new(Trak)
        .with_child(Boxes::new(Tkhd {
            full_box: FullBox::default(),
            track_id,
            duration: u64::from(SAMPLE_COUNT * SAMPLE_DELTA),
            volume: 0,
            width: 640 << 16,
            height: 360 << 16,
        }))
        .with_child(
            Boxes::new(Mdia)
                .with_child(Boxes::new(Mdhd {
                    full_box: FullBox::default(),
                    timescale: TIME_SCALE,
                    duration: u64::from(SAMPLE_COUNT * SAMPLE_DELTA),
                    language: pack_language("eng"),
                }))
                .with_child(Boxes::new(handler))
                .with_child(Boxes::new(Minf).with_child(stbl)),
        )
}

fn track_payload(spec: &TrackSpec) -> Vec<u8> {
    let mut out = Vec::new();
    for _ in 0..SAMPLE_COUNT {
        match spec.kind {
            StreamKind::Video => {
                // One IDR NALU per sample.
                let nalu_len = spec.sample_size - 4;
                out.extend_from_slice(&nalu_len.to_be_bytes());
                out.push(0x65);
                out.extend(std::iter::repeat(0xab).take(nalu_len as usize - 1));
            }
            _ => out.extend(std::iter::repeat(0xcd).take(spec.sample_size as usize)),
        }
    }
    out
}

// Progressive MP4 with one chunk per track.
fn write_input_mp4(path: &Path, specs: &[TrackSpec]) {
    let build = |offsets: &[u32]| -> (Vec<u8>, Vec<u32>) {
        let mut moov = Boxes::new(Moov).with_child(Boxes::new(Mvhd {
            full_box: FullBox::default(),
            timescale: TIME_SCALE,
            duration: u64::from(SAMPLE_COUNT * SAMPLE_DELTA),
            next_track_id: specs.len() as u32 + 1,
        }));
        for (i, spec) in specs.iter().enumerate() {
            moov = moov.with_child(track_boxes(spec, i as u32 + 1, offsets[i]));
        }

        let ftyp = Boxes::new(Ftyp::init_segment());
        let mut payloads = Vec::new();
        for spec in specs {
            payloads.push(track_payload(spec));
        }

        let mut real_offsets = Vec::new();
        let mut cursor = ftyp.size() + moov.size() + 8;
        for payload in &payloads {
            real_offsets.push(cursor as u32);
            cursor += payload.len();
        }

        let mut out = Vec::new();
        ftyp.marshal(&mut out).unwrap();
        moov.marshal(&mut out).unwrap();
        Boxes::new(Mdat {
            payloads: payloads.into_iter().map(Into::into).collect(),
        })
        .marshal(&mut out)
        .unwrap();
        (out, real_offsets)
    };

    let (_, offsets) = build(&vec![0; specs.len()]);
    let (file, check) = build(&offsets);
    assert_eq!(offsets, check);
    std::fs::write(path, file).unwrap();
}

fn deps(log: &VodMediaInfoLog) -> RuntimeDeps {
    RuntimeDeps {
        logger: new_dummy_msg_logger(),
        clock: Arc::new(ZeroClock),
        iv_generator: Arc::new(FixedIvGenerator::new(vec![0x33; 16])),
        media_info: Some(log.clone()),
    }
}

fn raw_key_encryption(scheme: ProtectionScheme, clear_lead: f64) -> EncryptionParams {
    let mut key_map = BTreeMap::new();
    key_map.insert(
        String::new(),
        RawKeyPair {
            key_id: KEY_ID.to_vec(),
            key: KEY.to_vec(),
        },
    );
    EncryptionParams {
        key_provider: KeyProvider::RawKey,
        raw_key: RawKeyParams {
            key_map,
            iv: vec![0x11; 8],
            pssh: Vec::new(),
        },
        protection_scheme: scheme,
        clear_lead_in_seconds: clear_lead,
        ..EncryptionParams::default()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

#[test]
fn test_basic_packaging() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("bear-640x360.mp4");
    write_input_mp4(
        &input,
        &[
            TrackSpec {
                kind: StreamKind::Video,
                sample_size: 120,
            },
            TrackSpec {
                kind: StreamKind::Audio,
                sample_size: 48,
            },
        ],
    );

    let params = PackagingParams {
        chunking: ChunkingParams {
            segment_duration_in_seconds: 1.0,
            ..ChunkingParams::default()
        },
        single_threaded: true,
        ..PackagingParams::default()
    };
    let mut video = StreamDescriptor::new(
        input.clone(),
        StreamSelector::Kind(StreamKind::Video),
    );
    video.segment_template = Some(dir.path().join("video_$Number$.m4s").display().to_string());
    video.init_segment = Some(dir.path().join("video_init.mp4"));
    let mut audio = StreamDescriptor::new(input, StreamSelector::Kind(StreamKind::Audio));
    audio.segment_template = Some(dir.path().join("audio_$Number$.m4s").display().to_string());
    audio.init_segment = Some(dir.path().join("audio_init.mp4"));

    let log = VodMediaInfoLog::new();
    run_packager(&params, &[video, audio], &deps(&log)).unwrap();

    // One media record per output stream.
    let media = log.media();
    assert_eq!(2, media.len());
    for record in &media {
        assert_eq!(TOTAL_DURATION, record.media_duration);
    }

    // At or above one-second targets, 2.736 s yields three segments per
    // stream whose durations add up to the input duration.
    let video_segments: Vec<_> = log
        .segments()
        .into_iter()
        .filter(|s| s.output.contains("video"))
        .collect();
    assert_eq!(3, video_segments.len());
    let total: i64 = video_segments.iter().map(|s| s.duration).sum();
    assert_eq!(TOTAL_DURATION, total);

    assert!(dir.path().join("video_init.mp4").exists());
    assert!(dir.path().join("video_1.m4s").exists());
    assert!(dir.path().join("audio_3.m4s").exists());
}

#[test]
fn test_cenc_packaging_with_clear_lead() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.mp4");
    write_input_mp4(
        &input,
        &[TrackSpec {
            kind: StreamKind::Video,
            sample_size: 120,
        }],
    );

    let params = PackagingParams {
        chunking: ChunkingParams {
            segment_duration_in_seconds: 1.0,
            ..ChunkingParams::default()
        },
        encryption: raw_key_encryption(ProtectionScheme::Cenc, 1.0),
        single_threaded: true,
        ..PackagingParams::default()
    };
    let mut video = StreamDescriptor::new(input, StreamSelector::Kind(StreamKind::Video));
    video.segment_template = Some(dir.path().join("v_$Number$.m4s").display().to_string());
    video.init_segment = Some(dir.path().join("v_init.mp4"));

    let log = VodMediaInfoLog::new();
    run_packager(&params, &[video], &deps(&log)).unwrap();

    // The init segment advertises the protected sample entry.
    let init = std::fs::read(dir.path().join("v_init.mp4")).unwrap();
    assert!(find_subslice(&init, b"encv"));
    assert!(find_subslice(&init, b"tenc"));
    assert!(find_subslice(&init, &KEY_ID));

    // First segment is in the clear lead, later segments carry senc.
    let first = std::fs::read(dir.path().join("v_1.m4s")).unwrap();
    assert!(!find_subslice(&first, b"senc"));
    let second = std::fs::read(dir.path().join("v_2.m4s")).unwrap();
    assert!(find_subslice(&second, b"senc"));
    let third = std::fs::read(dir.path().join("v_3.m4s")).unwrap();
    assert!(find_subslice(&third, b"senc"));
}

#[test]
fn test_replicated_outputs_share_one_stream() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.mp4");
    write_input_mp4(
        &input,
        &[TrackSpec {
            kind: StreamKind::Audio,
            sample_size: 64,
        }],
    );

    let params = PackagingParams {
        chunking: ChunkingParams {
            segment_duration_in_seconds: 1.0,
            ..ChunkingParams::default()
        },
        single_threaded: true,
        ..PackagingParams::default()
    };
    let mut dash = StreamDescriptor::new(
        input.clone(),
        StreamSelector::Kind(StreamKind::Audio),
    );
    dash.segment_template = Some(dir.path().join("a_$Number$.m4s").display().to_string());
    dash.init_segment = Some(dir.path().join("a_init.mp4"));
    dash.dash_only = true;
    let mut hls = StreamDescriptor::new(input, StreamSelector::Kind(StreamKind::Audio));
    hls.segment_template = Some(dir.path().join("a_$Number$.ts").display().to_string());
    hls.hls_only = true;

    let log = VodMediaInfoLog::new();
    run_packager(&params, &[dash, hls], &deps(&log)).unwrap();

    assert!(dir.path().join("a_1.m4s").exists());
    assert!(dir.path().join("a_1.ts").exists());
    assert_eq!(2, log.media().len());
}

#[test]
fn test_exit_codes() {
    let log = VodMediaInfoLog::new();
    let deps = deps(&log);

    // No descriptors: argument validation failure.
    let params = PackagingParams {
        chunking: ChunkingParams {
            segment_duration_in_seconds: 1.0,
            ..ChunkingParams::default()
        },
        ..PackagingParams::default()
    };
    let result = run_packager(&params, &[], &deps);
    assert_eq!(1, exit_code(&result));

    // Invalid chunking configuration.
    let bad = PackagingParams::default();
    let mut descriptor = StreamDescriptor::new("in.mp4", StreamSelector::Index(0));
    descriptor.output = Some("out.mp4".into());
    let result = run_packager(&bad, std::slice::from_ref(&descriptor), &deps);
    assert_eq!(1, exit_code(&result));

    // Missing input file: packaging failure.
    let result = run_packager(&params, &[descriptor], &deps);
    assert_eq!(2, exit_code(&result));

    assert_eq!(0, exit_code(&Ok(())));
}

#[test]
fn test_audio_ts_sampling_rate_contract() {
    // 44100 Hz fits the ADTS frequency table used by the ts muxer.
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.mp4");
    write_input_mp4(
        &input,
        &[TrackSpec {
            kind: StreamKind::Audio,
            sample_size: 32,
        }],
    );

    let params = PackagingParams {
        chunking: ChunkingParams {
            segment_duration_in_seconds: 1.0,
            ..ChunkingParams::default()
        },
        single_threaded: true,
        ..PackagingParams::default()
    };
    let mut descriptor =
        StreamDescriptor::new(input, StreamSelector::Kind(StreamKind::Audio));
    descriptor.segment_template = Some(dir.path().join("a_$Number$.ts").display().to_string());

    let log = VodMediaInfoLog::new();
    run_packager(&params, &[descriptor], &deps(&log)).unwrap();

    let segment = std::fs::read(dir.path().join("a_1.ts")).unwrap();
    assert_eq!(0, segment.len() % 188);
}
