//! Progressive MP4 demuxing: walk the moov sample tables and turn the file
//! into stream infos and media samples. Inputs are pre-buffered byte
//! streams; fragmented inputs are not handled here.

use crate::{BoxType, Mp4Error};
use bytes::Bytes;
use common::{
    AudioDetails, Codec, MediaSample, PipelineError, StreamDetails, StreamInfo, StreamSelector,
    VideoDetails,
};
use pipeline::{CancelToken, HandlerBase, MediaHandler, OriginHandler};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default)]
pub struct Mp4DemuxerOptions {
    /// Shift presentation timestamps so the first sample's composition
    /// offset becomes zero.
    pub reset_initial_composition_offset_to_zero: bool,
}

#[derive(Clone, Copy, Debug)]
struct SampleRef {
    dts: i64,
    pts: i64,
    duration: i64,
    is_key_frame: bool,
    offset: usize,
    size: usize,
}

struct Track {
    info: StreamInfo,
    samples: Vec<SampleRef>,
}

/// Origin handler reading a progressive MP4 file. One output stream per
/// selector, in selector order.
pub struct Mp4Demuxer {
    base: HandlerBase,
    data: Bytes,
    selectors: Vec<StreamSelector>,
    options: Mp4DemuxerOptions,
    cancel: CancelToken,
}

impl Mp4Demuxer {
    #[must_use]
    pub fn new(data: Bytes, selectors: Vec<StreamSelector>, options: Mp4DemuxerOptions) -> Self {
        Self {
            base: HandlerBase::new(),
            data,
            selectors,
            options,
            cancel: CancelToken::new(),
        }
    }

    // Indices refer to the original container order; kind selectors pick
    // the first not-yet-selected track of that kind.
    fn selected_tracks(&self, tracks: Vec<Track>) -> Result<Vec<Track>, PipelineError> {
        let mut remaining: Vec<Option<Track>> = tracks.into_iter().map(Some).collect();
        let mut selected = Vec::with_capacity(self.selectors.len());
        for selector in &self.selectors {
            let position = match selector {
                StreamSelector::Index(index) => {
                    (*index < remaining.len() && remaining[*index].is_some()).then_some(*index)
                }
                StreamSelector::Kind(kind) => remaining.iter().position(|t| {
                    t.as_ref().is_some_and(|track| track.info.kind() == *kind)
                }),
            };
            let Some(position) = position else {
                return Err(PipelineError::InvalidArgument(format!(
                    "no stream matches selector {selector:?}"
                )));
            };
            selected.push(remaining[position].take().expect("position is occupied"));
        }
        Ok(selected)
    }
}

impl MediaHandler for Mp4Demuxer {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, _data: common::StreamData) -> Result<(), PipelineError> {
        Err(PipelineError::Internal(
            "origin handlers do not accept input".to_owned(),
        ))
    }
}

impl OriginHandler for Mp4Demuxer {
    fn run(&mut self) -> Result<(), PipelineError> {
        let tracks =
            parse(&self.data, self.options).map_err(|e| PipelineError::Parse(e.to_string()))?;
        let tracks = self.selected_tracks(tracks)?;

        for (output, track) in tracks.iter().enumerate() {
            self.base
                .dispatch_stream_info(output, Arc::new(track.info.clone()))?;
        }

        // Emit samples interleaved across tracks in decode order.
        let mut cursors = vec![0_usize; tracks.len()];
        loop {
            if self.cancel.is_cancelled() {
                self.base.flush_all_downstreams()?;
                return Err(PipelineError::Cancelled);
            }
            let mut next: Option<(usize, i64)> = None;
            for (output, track) in tracks.iter().enumerate() {
                if let Some(sample) = track.samples.get(cursors[output]) {
                    if next.is_none() || sample.dts < next.expect("checked").1 {
                        next = Some((output, sample.dts));
                    }
                }
            }
            let Some((output, _)) = next else {
                break;
            };
            let sample = &tracks[output].samples[cursors[output]];
            cursors[output] += 1;

            let data = self.data.slice(sample.offset..sample.offset + sample.size);
            self.base.dispatch_media_sample(
                output,
                MediaSample::new(
                    sample.dts,
                    sample.pts,
                    sample.duration,
                    sample.is_key_frame,
                    data,
                ),
            )?;
        }
        self.base.flush_all_downstreams()
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

struct BoxReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BoxReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn next_box(&mut self) -> Result<Option<(BoxType, &'a [u8])>, Mp4Error> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        if self.pos + 8 > self.data.len() {
            return Err(Mp4Error::Parse(format!(
                "truncated box header at {}",
                self.pos
            )));
        }
        let size32 = u32::from_be_bytes(
            self.data[self.pos..self.pos + 4]
                .try_into()
                .expect("4 bytes"),
        );
        let mut typ = [0_u8; 4];
        typ.copy_from_slice(&self.data[self.pos + 4..self.pos + 8]);

        let (header, size) = match size32 {
            0 => (8, self.data.len() - self.pos),
            1 => {
                if self.pos + 16 > self.data.len() {
                    return Err(Mp4Error::Parse("truncated largesize".to_owned()));
                }
                let size64 = u64::from_be_bytes(
                    self.data[self.pos + 8..self.pos + 16]
                        .try_into()
                        .expect("8 bytes"),
                );
                (
                    16,
                    usize::try_from(size64)
                        .map_err(|e| Mp4Error::FromInt("largesize".to_owned(), e))?,
                )
            }
            n => (
                8,
                usize::try_from(n).map_err(|e| Mp4Error::FromInt("box size".to_owned(), e))?,
            ),
        };
        if size < header || self.pos + size > self.data.len() {
            return Err(Mp4Error::Parse(format!(
                "box '{}' with size {size} overruns the file",
                String::from_utf8_lossy(&typ)
            )));
        }
        let payload = &self.data[self.pos + header..self.pos + size];
        self.pos += size;
        Ok(Some((typ, payload)))
    }

    fn find(data: &'a [u8], typ: BoxType) -> Result<Option<&'a [u8]>, Mp4Error> {
        let mut reader = BoxReader::new(data);
        while let Some((t, payload)) = reader.next_box()? {
            if t == typ {
                return Ok(Some(payload));
            }
        }
        Ok(None)
    }
}

fn parse(data: &[u8], options: Mp4DemuxerOptions) -> Result<Vec<Track>, Mp4Error> {
    let moov =
        BoxReader::find(data, *b"moov")?.ok_or_else(|| Mp4Error::Parse("no moov box".to_owned()))?;

    let mut tracks = Vec::new();
    let mut reader = BoxReader::new(moov);
    while let Some((typ, payload)) = reader.next_box()? {
        if typ == *b"trak" {
            tracks.push(parse_trak(payload, data, options)?);
        }
    }
    if tracks.is_empty() {
        return Err(Mp4Error::Parse("no tracks".to_owned()));
    }
    Ok(tracks)
}

fn parse_trak(
    trak: &[u8],
    file: &[u8],
    options: Mp4DemuxerOptions,
) -> Result<Track, Mp4Error> {
    let tkhd =
        BoxReader::find(trak, *b"tkhd")?.ok_or_else(|| Mp4Error::Parse("no tkhd".to_owned()))?;
    let (width, height) = parse_tkhd_dimensions(tkhd)?;

    let mdia =
        BoxReader::find(trak, *b"mdia")?.ok_or_else(|| Mp4Error::Parse("no mdia".to_owned()))?;
    let mdhd =
        BoxReader::find(mdia, *b"mdhd")?.ok_or_else(|| Mp4Error::Parse("no mdhd".to_owned()))?;
    let (time_scale, duration, language) = parse_mdhd(mdhd)?;

    let minf =
        BoxReader::find(mdia, *b"minf")?.ok_or_else(|| Mp4Error::Parse("no minf".to_owned()))?;
    let stbl =
        BoxReader::find(minf, *b"stbl")?.ok_or_else(|| Mp4Error::Parse("no stbl".to_owned()))?;
    let stsd =
        BoxReader::find(stbl, *b"stsd")?.ok_or_else(|| Mp4Error::Parse("no stsd".to_owned()))?;

    let entry = parse_stsd(stsd, width, height)?;
    let samples = parse_sample_tables(stbl, file, options)?;

    let info = StreamInfo {
        codec: entry.codec,
        time_scale,
        duration,
        codec_config: entry.codec_config.into(),
        codec_string: entry.codec_string,
        language,
        is_encrypted: false,
        encryption_config: None,
        details: entry.details,
    };
    Ok(Track { info, samples })
}

fn parse_tkhd_dimensions(tkhd: &[u8]) -> Result<(u32, u32), Mp4Error> {
    if tkhd.is_empty() {
        return Err(Mp4Error::Parse("empty tkhd".to_owned()));
    }
    let size = if tkhd[0] == 0 { 84 } else { 96 };
    if tkhd.len() < size {
        return Err(Mp4Error::Parse("truncated tkhd".to_owned()));
    }
    let width = u32::from_be_bytes(tkhd[size - 8..size - 4].try_into().expect("4 bytes")) >> 16;
    let height = u32::from_be_bytes(tkhd[size - 4..size].try_into().expect("4 bytes")) >> 16;
    Ok((width, height))
}

fn parse_mdhd(mdhd: &[u8]) -> Result<(u32, i64, String), Mp4Error> {
    if mdhd.is_empty() {
        return Err(Mp4Error::Parse("empty mdhd".to_owned()));
    }
    let (time_scale, duration, lang_offset) = if mdhd[0] == 0 {
        if mdhd.len() < 24 {
            return Err(Mp4Error::Parse("truncated mdhd".to_owned()));
        }
        let ts = u32::from_be_bytes(mdhd[12..16].try_into().expect("4 bytes"));
        let dur = i64::from(u32::from_be_bytes(mdhd[16..20].try_into().expect("4 bytes")));
        (ts, dur, 20)
    } else {
        if mdhd.len() < 36 {
            return Err(Mp4Error::Parse("truncated mdhd".to_owned()));
        }
        let ts = u32::from_be_bytes(mdhd[20..24].try_into().expect("4 bytes"));
        let dur = i64::try_from(u64::from_be_bytes(
            mdhd[24..32].try_into().expect("8 bytes"),
        ))
        .map_err(|e| Mp4Error::FromInt("mdhd duration".to_owned(), e))?;
        (ts, dur, 32)
    };
    if time_scale == 0 {
        return Err(Mp4Error::Parse("zero timescale".to_owned()));
    }
    let packed = u16::from_be_bytes(
        mdhd[lang_offset..lang_offset + 2]
            .try_into()
            .expect("2 bytes"),
    );
    let language = unpack_language(packed);
    Ok((time_scale, duration, language))
}

fn unpack_language(packed: u16) -> String {
    let chars = [
        u8::try_from((packed >> 10) & 0x1f).expect("5 bits") + 0x60,
        u8::try_from((packed >> 5) & 0x1f).expect("5 bits") + 0x60,
        u8::try_from(packed & 0x1f).expect("5 bits") + 0x60,
    ];
    if chars.iter().all(u8::is_ascii_lowercase) {
        String::from_utf8_lossy(&chars).into_owned()
    } else {
        "und".to_owned()
    }
}

struct SampleEntry {
    codec: Codec,
    codec_config: Vec<u8>,
    codec_string: String,
    details: StreamDetails,
}

fn parse_stsd(stsd: &[u8], width: u32, height: u32) -> Result<SampleEntry, Mp4Error> {
    if stsd.len() < 8 {
        return Err(Mp4Error::Parse("truncated stsd".to_owned()));
    }
    let mut reader = BoxReader::new(&stsd[8..]);
    let Some((typ, payload)) = reader.next_box()? else {
        return Err(Mp4Error::Parse("empty stsd".to_owned()));
    };

    match &typ {
        b"encv" | b"enca" => Err(Mp4Error::Unsupported(
            "encrypted input streams".to_owned(),
        )),
        b"avc1" | b"avc3" => {
            let config = BoxReader::find(payload.get(78..).unwrap_or(&[]), *b"avcC")?
                .ok_or_else(|| Mp4Error::Parse("no avcC".to_owned()))?;
            if config.len() < 5 {
                return Err(Mp4Error::Parse("truncated avcC".to_owned()));
            }
            Ok(SampleEntry {
                codec: Codec::H264,
                codec_config: config.to_vec(),
                codec_string: format!(
                    "avc1.{:02x}{:02x}{:02x}",
                    config[1], config[2], config[3]
                ),
                details: StreamDetails::Video(VideoDetails {
                    width,
                    height,
                    nalu_length_size: (config[4] & 0x3) + 1,
                    ..VideoDetails::default()
                }),
            })
        }
        b"hvc1" | b"hev1" => {
            let config = BoxReader::find(payload.get(78..).unwrap_or(&[]), *b"hvcC")?
                .ok_or_else(|| Mp4Error::Parse("no hvcC".to_owned()))?;
            if config.len() < 22 {
                return Err(Mp4Error::Parse("truncated hvcC".to_owned()));
            }
            Ok(SampleEntry {
                codec: Codec::H265,
                codec_config: config.to_vec(),
                codec_string: "hvc1.1.6.L93.B0".to_owned(),
                details: StreamDetails::Video(VideoDetails {
                    width,
                    height,
                    nalu_length_size: (config[21] & 0x3) + 1,
                    ..VideoDetails::default()
                }),
            })
        }
        b"vp09" => {
            let config = BoxReader::find(payload.get(78..).unwrap_or(&[]), *b"vpcC")?
                .unwrap_or(&[]);
            Ok(SampleEntry {
                codec: Codec::Vp9,
                codec_config: config.to_vec(),
                codec_string: "vp09.00.10.08".to_owned(),
                details: StreamDetails::Video(VideoDetails {
                    width,
                    height,
                    ..VideoDetails::default()
                }),
            })
        }
        b"av01" => {
            let config = BoxReader::find(payload.get(78..).unwrap_or(&[]), *b"av1C")?
                .unwrap_or(&[]);
            Ok(SampleEntry {
                codec: Codec::Av1,
                codec_config: config.to_vec(),
                codec_string: "av01.0.04M.08".to_owned(),
                details: StreamDetails::Video(VideoDetails {
                    width,
                    height,
                    ..VideoDetails::default()
                }),
            })
        }
        b"mp4a" => {
            if payload.len() < 28 {
                return Err(Mp4Error::Parse("truncated mp4a".to_owned()));
            }
            let channel_count = u16::from_be_bytes(payload[16..18].try_into().expect("2 bytes"));
            let sample_size = u16::from_be_bytes(payload[18..20].try_into().expect("2 bytes"));
            let sample_rate =
                u32::from_be_bytes(payload[24..28].try_into().expect("4 bytes")) >> 16;
            let config = BoxReader::find(&payload[28..], *b"esds")?.unwrap_or(&[]);
            Ok(SampleEntry {
                codec: Codec::Aac,
                codec_config: config.to_vec(),
                codec_string: "mp4a.40.2".to_owned(),
                details: StreamDetails::Audio(AudioDetails {
                    sampling_frequency: sample_rate,
                    num_channels: u8::try_from(channel_count).unwrap_or(2),
                    sample_bits: u8::try_from(sample_size).unwrap_or(16),
                }),
            })
        }
        b"ac-3" | b"ec-3" => {
            if payload.len() < 28 {
                return Err(Mp4Error::Parse("truncated audio entry".to_owned()));
            }
            let channel_count = u16::from_be_bytes(payload[16..18].try_into().expect("2 bytes"));
            let sample_rate =
                u32::from_be_bytes(payload[24..28].try_into().expect("4 bytes")) >> 16;
            let (codec, codec_string) = if &typ == b"ac-3" {
                (Codec::Ac3, "ac-3".to_owned())
            } else {
                (Codec::Ec3, "ec-3".to_owned())
            };
            Ok(SampleEntry {
                codec,
                codec_config: Vec::new(),
                codec_string,
                details: StreamDetails::Audio(AudioDetails {
                    sampling_frequency: sample_rate,
                    num_channels: u8::try_from(channel_count).unwrap_or(6),
                    sample_bits: 16,
                }),
            })
        }
        b"wvtt" | b"tx3g" => Ok(SampleEntry {
            codec: Codec::WebVtt,
            codec_config: Vec::new(),
            codec_string: "wvtt".to_owned(),
            details: StreamDetails::Text,
        }),
        other => Err(Mp4Error::Unsupported(format!(
            "sample entry '{}'",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn read_u32_table(payload: &[u8], entry_words: usize) -> Result<Vec<Vec<u32>>, Mp4Error> {
    if payload.len() < 8 {
        return Err(Mp4Error::Parse("truncated table".to_owned()));
    }
    let count = usize::try_from(u32::from_be_bytes(
        payload[4..8].try_into().expect("4 bytes"),
    ))
    .expect("u32 fits usize");
    let need = 8 + count * entry_words * 4;
    if payload.len() < need {
        return Err(Mp4Error::Parse("table overruns box".to_owned()));
    }
    let mut out = Vec::with_capacity(count);
    let mut pos = 8;
    for _ in 0..count {
        let mut entry = Vec::with_capacity(entry_words);
        for _ in 0..entry_words {
            entry.push(u32::from_be_bytes(
                payload[pos..pos + 4].try_into().expect("4 bytes"),
            ));
            pos += 4;
        }
        out.push(entry);
    }
    Ok(out)
}

#[allow(clippy::too_many_lines)]
fn parse_sample_tables(
    stbl: &[u8],
    file: &[u8],
    options: Mp4DemuxerOptions,
) -> Result<Vec<SampleRef>, Mp4Error> {
    let stts = BoxReader::find(stbl, *b"stts")?
        .ok_or_else(|| Mp4Error::Parse("no stts".to_owned()))?;
    let stsz = BoxReader::find(stbl, *b"stsz")?
        .ok_or_else(|| Mp4Error::Parse("no stsz".to_owned()))?;
    let stsc = BoxReader::find(stbl, *b"stsc")?
        .ok_or_else(|| Mp4Error::Parse("no stsc".to_owned()))?;
    let stco = BoxReader::find(stbl, *b"stco")?;
    let co64 = BoxReader::find(stbl, *b"co64")?;
    let ctts = BoxReader::find(stbl, *b"ctts")?;
    let stss = BoxReader::find(stbl, *b"stss")?;

    // Sizes: either a constant size or one entry per sample.
    if stsz.len() < 12 {
        return Err(Mp4Error::Parse("truncated stsz".to_owned()));
    }
    let constant_size = u32::from_be_bytes(stsz[4..8].try_into().expect("4 bytes"));
    let sample_count = usize::try_from(u32::from_be_bytes(
        stsz[8..12].try_into().expect("4 bytes"),
    ))
    .expect("u32 fits usize");
    let mut sizes = Vec::with_capacity(sample_count);
    if constant_size != 0 {
        sizes.resize(sample_count, usize::try_from(constant_size).expect("fits"));
    } else {
        if stsz.len() < 12 + sample_count * 4 {
            return Err(Mp4Error::Parse("stsz overruns box".to_owned()));
        }
        for i in 0..sample_count {
            let pos = 12 + i * 4;
            sizes.push(
                usize::try_from(u32::from_be_bytes(
                    stsz[pos..pos + 4].try_into().expect("4 bytes"),
                ))
                .expect("u32 fits usize"),
            );
        }
    }

    // Decode timestamps and durations.
    let mut dts_list = Vec::with_capacity(sample_count);
    let mut durations = Vec::with_capacity(sample_count);
    let mut dts = 0_i64;
    for entry in read_u32_table(stts, 2)? {
        for _ in 0..entry[0] {
            dts_list.push(dts);
            durations.push(i64::from(entry[1]));
            dts += i64::from(entry[1]);
        }
    }
    if dts_list.len() != sample_count {
        return Err(Mp4Error::Parse(format!(
            "stts covers {} samples, stsz has {sample_count}",
            dts_list.len()
        )));
    }

    // Composition offsets.
    let mut pts_offsets = vec![0_i64; sample_count];
    if let Some(ctts) = ctts {
        if ctts.is_empty() {
            return Err(Mp4Error::Parse("empty ctts".to_owned()));
        }
        let version = ctts[0];
        let mut index = 0_usize;
        for entry in read_u32_table(ctts, 2)? {
            #[allow(clippy::cast_possible_wrap, clippy::as_conversions)]
            let offset = if version == 0 {
                i64::from(entry[1])
            } else {
                i64::from(entry[1] as i32)
            };
            for _ in 0..entry[0] {
                if index < sample_count {
                    pts_offsets[index] = offset;
                }
                index += 1;
            }
        }
    }
    if options.reset_initial_composition_offset_to_zero && sample_count > 0 {
        let shift = pts_offsets[0];
        for offset in &mut pts_offsets {
            *offset -= shift;
        }
    }

    // Sync samples. No stss box means every sample is a sync sample.
    let mut key_frames = vec![stss.is_none(); sample_count];
    if let Some(stss) = stss {
        for entry in read_u32_table(stss, 1)? {
            let index = usize::try_from(entry[0]).expect("u32 fits usize");
            if index >= 1 && index <= sample_count {
                key_frames[index - 1] = true;
            }
        }
    }

    // Chunk offsets.
    let chunk_offsets: Vec<usize> = if let Some(stco) = stco {
        read_u32_table(stco, 1)?
            .into_iter()
            .map(|e| usize::try_from(e[0]).expect("u32 fits usize"))
            .collect()
    } else if let Some(co64) = co64 {
        if co64.len() < 8 {
            return Err(Mp4Error::Parse("truncated co64".to_owned()));
        }
        let count = usize::try_from(u32::from_be_bytes(
            co64[4..8].try_into().expect("4 bytes"),
        ))
        .expect("u32 fits usize");
        if co64.len() < 8 + count * 8 {
            return Err(Mp4Error::Parse("co64 overruns box".to_owned()));
        }
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let pos = 8 + i * 8;
            offsets.push(
                usize::try_from(u64::from_be_bytes(
                    co64[pos..pos + 8].try_into().expect("8 bytes"),
                ))
                .map_err(|e| Mp4Error::FromInt("chunk offset".to_owned(), e))?,
            );
        }
        offsets
    } else {
        return Err(Mp4Error::Parse("no stco or co64".to_owned()));
    };

    // Sample-to-chunk mapping.
    let stsc_entries = read_u32_table(stsc, 3)?;
    let mut samples = Vec::with_capacity(sample_count);
    let mut sample_index = 0_usize;
    for (i, entry) in stsc_entries.iter().enumerate() {
        let first_chunk = usize::try_from(entry[0]).expect("u32 fits usize");
        let samples_per_chunk = usize::try_from(entry[1]).expect("u32 fits usize");
        let last_chunk = match stsc_entries.get(i + 1) {
            Some(next) => usize::try_from(next[0]).expect("u32 fits usize"),
            None => chunk_offsets.len() + 1,
        };
        for chunk in first_chunk..last_chunk {
            let Some(&chunk_offset) = chunk_offsets.get(chunk - 1) else {
                break;
            };
            let mut offset = chunk_offset;
            for _ in 0..samples_per_chunk {
                if sample_index >= sample_count {
                    break;
                }
                let size = sizes[sample_index];
                if offset + size > file.len() {
                    return Err(Mp4Error::Parse(format!(
                        "sample {sample_index} overruns the file"
                    )));
                }
                samples.push(SampleRef {
                    dts: dts_list[sample_index],
                    pts: dts_list[sample_index] + pts_offsets[sample_index],
                    duration: durations[sample_index],
                    is_key_frame: key_frames[sample_index],
                    offset,
                    size,
                });
                offset += size;
                sample_index += 1;
            }
        }
    }
    if sample_index != sample_count {
        return Err(Mp4Error::Parse(format!(
            "chunk tables cover {sample_index} samples, expected {sample_count}"
        )));
    }
    Ok(samples)
}
