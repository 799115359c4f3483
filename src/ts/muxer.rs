use crate::{
    crc32_mpeg2, TsError, ELEMENTARY_PID, PAT_PID, PMT_PID, STREAM_TYPE_ADTS_AAC,
    STREAM_TYPE_H264, SYNC_BYTE, TS_PACKET_SIZE, TS_TIMESCALE,
};
use common::{
    time::rescale_ticks, Codec, MediaSample, MuxerListener, PipelineError, SegmentInfo,
    StreamData, StreamInfo, StreamPayload,
};
use pipeline::{HandlerBase, MediaHandler};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct TsMuxerOptions {
    /// Expands `$Number$` and `$Time$`, one file per segment.
    pub segment_template: String,
}

/// Terminal handler serializing one stream into MPEG-2 TS segments.
pub struct TsMuxer {
    base: HandlerBase,
    options: TsMuxerOptions,
    listener: Box<dyn MuxerListener>,
    info: Option<Arc<StreamInfo>>,
    // Parsed from the avcC so key frames can carry parameter sets in band.
    parameter_sets: Vec<Vec<u8>>,
    pending_samples: Vec<MediaSample>,
    segment_number: u32,
    continuity: u8,
    total_duration: i64,
}

impl TsMuxer {
    #[must_use]
    pub fn new(options: TsMuxerOptions, listener: Box<dyn MuxerListener>) -> Self {
        Self {
            base: HandlerBase::new(),
            options,
            listener,
            info: None,
            parameter_sets: Vec::new(),
            pending_samples: Vec::new(),
            segment_number: 1,
            continuity: 0,
            total_duration: 0,
        }
    }

    fn stream_type(info: &StreamInfo) -> Result<u8, TsError> {
        match info.codec {
            Codec::H264 => Ok(STREAM_TYPE_H264),
            Codec::Aac => Ok(STREAM_TYPE_ADTS_AAC),
            other => Err(TsError::UnsupportedCodec(format!("{other:?}"))),
        }
    }

    fn on_stream_info(&mut self, info: &Arc<StreamInfo>) -> Result<(), PipelineError> {
        Self::stream_type(info).map_err(|e| PipelineError::UnsupportedStream(e.to_string()))?;
        if info.codec == Codec::H264 {
            self.parameter_sets = parse_avcc_parameter_sets(&info.codec_config)
                .map_err(|e| PipelineError::Parse(e.to_string()))?;
        }
        self.listener.on_media_start(info);
        self.info = Some(info.clone());
        Ok(())
    }

    fn on_segment_info(&mut self, info: &SegmentInfo) -> Result<(), PipelineError> {
        if info.is_subsegment {
            return Ok(());
        }
        let stream_info = self.info.as_ref().ok_or_else(|| {
            PipelineError::Internal("segment info before stream info".to_owned())
        })?;
        let samples = std::mem::take(&mut self.pending_samples);
        if samples.is_empty() {
            return Ok(());
        }

        let mut segment = Vec::new();
        self.continuity = 0;
        write_psi(&mut segment, PAT_PID, &pat_section(), &mut 0);
        let stream_type =
            Self::stream_type(stream_info).map_err(|e| PipelineError::Internal(e.to_string()))?;
        write_psi(&mut segment, PMT_PID, &pmt_section(stream_type), &mut 0);

        for sample in &samples {
            let pes = build_pes(stream_info, sample, &self.parameter_sets)
                .map_err(|e| PipelineError::Internal(e.to_string()))?;
            let pcr = sample.is_key_frame.then(|| {
                rescale_ticks(sample.dts, stream_info.time_scale, TS_TIMESCALE).unwrap_or(0)
            });
            write_pes_packets(&mut segment, ELEMENTARY_PID, &pes, pcr, &mut self.continuity);
        }

        let name = crate::expand_segment_template(
            &self.options.segment_template,
            self.segment_number,
            info.start_timestamp,
        );
        self.segment_number += 1;
        std::fs::write(&name, &segment)?;
        self.total_duration += info.duration;
        self.listener.on_new_segment(
            &name,
            info.start_timestamp,
            info.duration,
            segment.len().try_into().unwrap_or(u64::MAX),
        );
        Ok(())
    }
}

impl MediaHandler for TsMuxer {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, data: StreamData) -> Result<(), PipelineError> {
        match data.payload {
            StreamPayload::StreamInfo(info) => self.on_stream_info(&info),
            StreamPayload::MediaSample(sample) => {
                self.pending_samples.push(sample);
                Ok(())
            }
            StreamPayload::SegmentInfo(info) => self.on_segment_info(&info),
            StreamPayload::Cue(_) | StreamPayload::Scte35(_) => Ok(()),
            StreamPayload::TextSample(_) => Err(PipelineError::InvalidArgument(
                "text samples in a ts muxer".to_owned(),
            )),
        }
    }

    fn on_flush_request(&mut self, _input_index: usize) -> Result<(), PipelineError> {
        if !self.pending_samples.is_empty() {
            // A stream without a trailing segment info; close it as one
            // final segment.
            let start = self.pending_samples.first().map_or(0, |s| s.dts);
            let end = self
                .pending_samples
                .last()
                .map_or(0, |s| s.dts + s.duration.max(0));
            self.on_segment_info(&SegmentInfo {
                start_timestamp: start,
                duration: end - start,
                is_final_chunk: true,
                ..SegmentInfo::default()
            })?;
        }
        self.listener.on_media_end(self.total_duration);
        Ok(())
    }
}

#[must_use]
pub fn expand_segment_template(template: &str, number: u32, time: i64) -> String {
    template
        .replace("$Number$", &number.to_string())
        .replace("$Time$", &time.to_string())
}

// avcC layout: config header, then SPS entries, then PPS entries, each
// length prefixed.
fn parse_avcc_parameter_sets(config: &[u8]) -> Result<Vec<Vec<u8>>, TsError> {
    if config.len() < 6 {
        return Err(TsError::InvalidCodecConfig("avcC too short".to_owned()));
    }
    let mut sets = Vec::new();
    let mut pos = 5;
    let sps_count = usize::from(config[pos] & 0x1f);
    pos += 1;
    for _ in 0..sps_count {
        sets.push(read_length_prefixed(config, &mut pos)?);
    }
    if pos >= config.len() {
        return Err(TsError::InvalidCodecConfig("missing pps count".to_owned()));
    }
    let pps_count = usize::from(config[pos]);
    pos += 1;
    for _ in 0..pps_count {
        sets.push(read_length_prefixed(config, &mut pos)?);
    }
    Ok(sets)
}

fn read_length_prefixed(data: &[u8], pos: &mut usize) -> Result<Vec<u8>, TsError> {
    if *pos + 2 > data.len() {
        return Err(TsError::InvalidCodecConfig(
            "truncated parameter set length".to_owned(),
        ));
    }
    let len = usize::from(u16::from_be_bytes(
        data[*pos..*pos + 2].try_into().expect("2 bytes"),
    ));
    *pos += 2;
    if *pos + len > data.len() {
        return Err(TsError::InvalidCodecConfig(
            "truncated parameter set".to_owned(),
        ));
    }
    let set = data[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(set)
}

fn pat_section() -> Vec<u8> {
    let mut section = vec![
        0x00, // Table id: PAT.
        0xb0, 0x0d, // Section syntax + length 13.
        0x00, 0x01, // Transport stream id.
        0xc1, // Version 0, current.
        0x00, 0x00, // Section and last section number.
        0x00, 0x01, // Program number 1.
    ];
    section.push(0xe0 | u8::try_from(PMT_PID >> 8).expect("pid fits"));
    section.push(u8::try_from(PMT_PID & 0xff).expect("pid fits"));
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn pmt_section(stream_type: u8) -> Vec<u8> {
    let pid_high = 0xe0 | u8::try_from(ELEMENTARY_PID >> 8).expect("pid fits");
    let pid_low = u8::try_from(ELEMENTARY_PID & 0xff).expect("pid fits");
    let mut section = vec![
        0x02, // Table id: PMT.
        0xb0, 0x12, // Section syntax + length 18.
        0x00, 0x01, // Program number.
        0xc1, // Version 0, current.
        0x00, 0x00, // Section and last section number.
        pid_high, pid_low, // PCR pid.
        0xf0, 0x00, // Program info length 0.
        stream_type,
        pid_high,
        pid_low,
        0xf0,
        0x00, // ES info length 0.
    ];
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

// One PSI table in its own packet, with a pointer field.
fn write_psi(out: &mut Vec<u8>, pid: u16, section: &[u8], continuity: &mut u8) {
    let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
    packet.push(SYNC_BYTE);
    packet.push(0x40 | u8::try_from(pid >> 8).expect("pid fits")); // Payload unit start.
    packet.push(u8::try_from(pid & 0xff).expect("pid fits"));
    packet.push(0x10 | (*continuity & 0x0f)); // Payload only.
    *continuity = continuity.wrapping_add(1);
    packet.push(0x00); // Pointer field.
    packet.extend_from_slice(section);
    packet.resize(TS_PACKET_SIZE, 0xff);
    out.extend_from_slice(&packet);
}

fn write_timestamp(out: &mut Vec<u8>, marker: u8, value: i64) {
    let v = u64::try_from(value.max(0)).expect("non-negative") & 0x1_ffff_ffff;
    out.push((marker << 4) | (u8::try_from((v >> 29) & 0x0e).expect("3 bits")) | 0x01);
    out.push(u8::try_from((v >> 22) & 0xff).expect("8 bits"));
    out.push(u8::try_from(((v >> 14) & 0xfe) | 0x01).expect("8 bits"));
    out.push(u8::try_from((v >> 7) & 0xff).expect("8 bits"));
    out.push(u8::try_from(((v << 1) & 0xfe) | 0x01).expect("8 bits"));
}

// PES packet: header plus the ES payload, already ADTS or Annex B framed.
fn build_pes(
    info: &StreamInfo,
    sample: &MediaSample,
    parameter_sets: &[Vec<u8>],
) -> Result<Vec<u8>, TsError> {
    let payload = match info.codec {
        Codec::H264 => annex_b_payload(info, sample, parameter_sets)?,
        Codec::Aac => adts_payload(info, sample)?,
        other => return Err(TsError::UnsupportedCodec(format!("{other:?}"))),
    };

    let pts =
        rescale_ticks(sample.pts, info.time_scale, TS_TIMESCALE).ok_or(TsError::TimestampOutOfRange)?;
    let dts =
        rescale_ticks(sample.dts, info.time_scale, TS_TIMESCALE).ok_or(TsError::TimestampOutOfRange)?;
    let with_dts = info.codec == Codec::H264 && dts != pts;

    let mut pes = vec![0x00, 0x00, 0x01];
    pes.push(if info.codec == Codec::H264 { 0xe0 } else { 0xc0 });

    let header_len: usize = if with_dts { 10 } else { 5 };
    let packet_len = payload.len() + header_len + 3;
    // Video PES may exceed the 16-bit length field; 0 means unbounded.
    let written_len = u16::try_from(packet_len).unwrap_or(0);
    pes.extend_from_slice(&written_len.to_be_bytes());
    pes.push(0x80); // Marker bits.
    pes.push(if with_dts { 0xc0 } else { 0x80 }); // PTS (+DTS) present.
    pes.push(u8::try_from(header_len).expect("header fits"));
    if with_dts {
        write_timestamp(&mut pes, 0x3, pts);
        write_timestamp(&mut pes, 0x1, dts);
    } else {
        write_timestamp(&mut pes, 0x2, pts);
    }
    pes.extend_from_slice(&payload);
    Ok(pes)
}

fn annex_b_payload(
    info: &StreamInfo,
    sample: &MediaSample,
    parameter_sets: &[Vec<u8>],
) -> Result<Vec<u8>, TsError> {
    let length_size = usize::from(info.video().map_or(4, |v| v.nalu_length_size.max(1)));

    let mut out = Vec::with_capacity(sample.data.len() + 64);
    // Access unit delimiter.
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x09, 0xf0]);
    if sample.is_key_frame {
        for set in parameter_sets {
            out.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
            out.extend_from_slice(set);
        }
    }

    let data = &sample.data;
    let mut pos = 0;
    while pos < data.len() {
        if pos + length_size > data.len() {
            return Err(TsError::InvalidCodecConfig("truncated nalu".to_owned()));
        }
        let mut len = 0_usize;
        for &b in &data[pos..pos + length_size] {
            len = (len << 8) | usize::from(b);
        }
        pos += length_size;
        if pos + len > data.len() {
            return Err(TsError::InvalidCodecConfig("nalu overruns sample".to_owned()));
        }
        out.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        out.extend_from_slice(&data[pos..pos + len]);
        pos += len;
    }
    Ok(out)
}

const ADTS_SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

fn adts_payload(info: &StreamInfo, sample: &MediaSample) -> Result<Vec<u8>, TsError> {
    let audio = info
        .audio()
        .ok_or_else(|| TsError::InvalidCodecConfig("aac without audio details".to_owned()))?;
    let frequency_index = ADTS_SAMPLING_FREQUENCIES
        .iter()
        .position(|&f| f == audio.sampling_frequency)
        .ok_or_else(|| {
            TsError::InvalidCodecConfig(format!(
                "sampling frequency {}",
                audio.sampling_frequency
            ))
        })?;
    let frequency_index = u8::try_from(frequency_index).expect("index fits");
    let channel_config = audio.num_channels & 0x07;
    let frame_len = sample.data.len() + 7;
    if frame_len > 0x1fff {
        return Err(TsError::InvalidCodecConfig("aac frame too large".to_owned()));
    }
    let frame_len = u16::try_from(frame_len).expect("checked above");

    let mut out = Vec::with_capacity(sample.data.len() + 7);
    out.push(0xff);
    out.push(0xf1); // MPEG-4, layer 0, no CRC.
    // Profile AAC-LC (object type 2).
    out.push((0x01 << 6) | (frequency_index << 2) | (channel_config >> 2));
    out.push(((channel_config & 0x03) << 6) | u8::try_from(frame_len >> 11).expect("2 bits"));
    out.push(u8::try_from((frame_len >> 3) & 0xff).expect("8 bits"));
    out.push(u8::try_from((frame_len & 0x07) << 5).expect("3 bits") | 0x1f);
    out.push(0xfc); // Buffer fullness, one frame.
    out.extend_from_slice(&sample.data);
    Ok(out)
}

// Split one PES into transport packets, with a PCR adaptation field on the
// first packet when given.
fn write_pes_packets(
    out: &mut Vec<u8>,
    pid: u16,
    pes: &[u8],
    pcr: Option<i64>,
    continuity: &mut u8,
) {
    let mut pos = 0;
    let mut first = true;
    while pos < pes.len() {
        let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
        packet.push(SYNC_BYTE);
        let start_flag = if first { 0x40 } else { 0x00 };
        packet.push(start_flag | u8::try_from(pid >> 8).expect("pid fits"));
        packet.push(u8::try_from(pid & 0xff).expect("pid fits"));

        let remaining = pes.len() - pos;
        let mut adaptation = Vec::new();
        if first {
            if let Some(pcr) = pcr {
                let base = u64::try_from(pcr.max(0)).expect("non-negative") & 0x1_ffff_ffff;
                adaptation.push(0x10); // PCR flag.
                adaptation.push(u8::try_from((base >> 25) & 0xff).expect("8 bits"));
                adaptation.push(u8::try_from((base >> 17) & 0xff).expect("8 bits"));
                adaptation.push(u8::try_from((base >> 9) & 0xff).expect("8 bits"));
                adaptation.push(u8::try_from((base >> 1) & 0xff).expect("8 bits"));
                adaptation.push(u8::try_from(((base & 0x01) << 7) | 0x7e).expect("8 bits"));
                adaptation.push(0x00); // PCR extension.
            }
        }

        // 4 header bytes, optionally 1 adaptation length byte plus the
        // field itself, payload fills the rest. Short payloads stuff the
        // adaptation field so every packet is exactly 188 bytes.
        let take;
        if adaptation.is_empty() && remaining >= TS_PACKET_SIZE - 4 {
            packet.push(0x10 | (*continuity & 0x0f)); // Payload only.
            take = TS_PACKET_SIZE - 4;
        } else {
            let mut field_len = adaptation.len();
            take = remaining.min(TS_PACKET_SIZE - 5 - field_len);
            if take < TS_PACKET_SIZE - 5 - field_len {
                field_len = TS_PACKET_SIZE - 5 - take;
            }
            packet.push(0x30 | (*continuity & 0x0f)); // Adaptation + payload.
            packet.push(u8::try_from(field_len).expect("field fits"));
            if field_len > 0 {
                if adaptation.is_empty() {
                    packet.push(0x00); // No flags set.
                } else {
                    packet.extend_from_slice(&adaptation);
                }
                let stuffing = field_len - adaptation.len().max(1);
                packet.extend(std::iter::repeat(0xff).take(stuffing));
            }
        }
        *continuity = continuity.wrapping_add(1);
        packet.extend_from_slice(&pes[pos..pos + take]);
        pos += take;
        debug_assert_eq!(TS_PACKET_SIZE, packet.len());
        out.extend_from_slice(&packet);
        first = false;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::{AudioDetails, StreamDetails, VideoDetails};
    use pretty_assertions::assert_eq;

    fn aac_info() -> Arc<StreamInfo> {
        Arc::new(StreamInfo {
            codec: Codec::Aac,
            time_scale: 44100,
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

    fn h264_info() -> Arc<StreamInfo> {
        // avcC with one SPS and one PPS.
        let avcc = vec![
            1, 0x64, 0x00, 0x1e, 0xff, //
            0xe1, 0x00, 0x03, 0x67, 0x64, 0x1e, // SPS.
            0x01, 0x00, 0x02, 0x68, 0xce, // PPS.
        ];
        Arc::new(StreamInfo {
            codec: Codec::H264,
            time_scale: 90000,
            duration: 0,
            codec_config: avcc.into(),
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

    #[test]
    fn test_parse_avcc_parameter_sets() {
        let sets = parse_avcc_parameter_sets(&h264_info().codec_config).unwrap();
        assert_eq!(vec![vec![0x67, 0x64, 0x1e], vec![0x68, 0xce]], sets);
    }

    #[test]
    fn test_adts_header() {
        let sample = MediaSample::new(0, 0, 1024, true, Bytes::from_static(&[0xab; 100]));
        let payload = adts_payload(&aac_info(), &sample).unwrap();
        assert_eq!(107, payload.len());
        assert_eq!(0xff, payload[0]);
        assert_eq!(0xf1, payload[1]);
        // Profile LC, frequency index 4 (44100), stereo.
        assert_eq!(0x50, payload[2]);
        assert_eq!(0x80, payload[3] & 0xc0);
        // 13-bit frame length covers the header.
        let len = (usize::from(payload[3] & 0x03) << 11)
            | (usize::from(payload[4]) << 3)
            | (usize::from(payload[5]) >> 5);
        assert_eq!(107, len);
    }

    #[test]
    fn test_annex_b_conversion_prepends_parameter_sets() {
        let info = h264_info();
        let sets = parse_avcc_parameter_sets(&info.codec_config).unwrap();
        let mut data = vec![0, 0, 0, 2, 0x65, 0xaa];
        data.extend_from_slice(&[0, 0, 0, 1, 0x41]);
        let sample = MediaSample::new(0, 0, 3000, true, data.into());
        let payload = annex_b_payload(&info, &sample, &sets).unwrap();

        let mut want = vec![0, 0, 0, 1, 0x09, 0xf0];
        want.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x64, 0x1e]);
        want.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xce]);
        want.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xaa]);
        want.extend_from_slice(&[0, 0, 0, 1, 0x41]);
        assert_eq!(want, payload);
    }

    #[test]
    fn test_segment_packets_are_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("seg_$Number$.ts").display().to_string();
        let mut muxer = TsMuxer::new(
            TsMuxerOptions {
                segment_template: template,
            },
            Box::new(common::NullMuxerListener),
        );

        muxer
            .process(StreamData::from_stream_info(0, aac_info()))
            .unwrap();
        for i in 0..3_i64 {
            muxer
                .process(StreamData::from_media_sample(
                    0,
                    MediaSample::new(i * 1024, i * 1024, 1024, true, Bytes::from(vec![7; 300])),
                ))
                .unwrap();
        }
        muxer
            .process(StreamData::from_segment_info(
                0,
                SegmentInfo {
                    start_timestamp: 0,
                    duration: 3 * 1024,
                    ..SegmentInfo::default()
                },
            ))
            .unwrap();
        muxer.on_flush_request(0).unwrap();

        let segment = std::fs::read(dir.path().join("seg_1.ts")).unwrap();
        assert_eq!(0, segment.len() % TS_PACKET_SIZE);
        // Every packet starts with the sync byte.
        for packet in segment.chunks(TS_PACKET_SIZE) {
            assert_eq!(SYNC_BYTE, packet[0]);
        }
        // PAT, then PMT.
        assert_eq!(0, u16::from(segment[1] & 0x1f) << 8 | u16::from(segment[2]));
        let pmt_pid =
            u16::from(segment[TS_PACKET_SIZE + 1] & 0x1f) << 8 | u16::from(segment[TS_PACKET_SIZE + 2]);
        assert_eq!(PMT_PID, pmt_pid);
    }

    #[test]
    fn test_rejects_unsupported_codec() {
        let mut muxer = TsMuxer::new(
            TsMuxerOptions {
                segment_template: "seg_$Number$.ts".to_owned(),
            },
            Box::new(common::NullMuxerListener),
        );
        let mut info = (*aac_info()).clone();
        info.codec = Codec::Opus;
        let err = muxer
            .process(StreamData::from_stream_info(0, Arc::new(info)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedStream(_)));
    }
}
