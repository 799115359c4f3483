//! Fragmented MP4 muxing: one init segment plus CMAF media segments, with
//! the CENC sample auxiliary boxes for encrypted tracks.

use crate::{
    AudioSampleEntry, Boxes, Dref, EmptyTable, Ftyp, FullBox, Hdlr, Mdat, Mdhd, Mfhd, Minf, Moof,
    Moov, Mp4Error, Mvex, Mvhd, RawBox, Saio, Saiz, Schi, Schm, Senc, SencEntry, Sidx, Sinf, Smhd,
    Stbl, Stsd, Tenc, Tfdt, Tfhd, Tkhd, Traf, Trex, Trun, TrunEntry, Url, VisualSampleEntry, Vmhd,
    pack_language, u32_to_flags, SAMPLE_FLAG_IS_NON_SYNC, SENC_SUBSAMPLE_FLAG,
    TFHD_DEFAULT_BASE_IS_MOOF, TKHD_FLAG_ENABLED, TKHD_FLAG_IN_MOVIE,
};
use common::{
    Codec, MediaSample, MuxerListener, PipelineError, SegmentInfo, StreamData, StreamInfo,
    StreamKind, StreamPayload,
};
use pipeline::{HandlerBase, MediaHandler};
use std::{io::Write, path::PathBuf, sync::Arc};

const TRACK_ID: u32 = 1;

#[derive(Clone, Debug)]
pub enum Mp4Output {
    /// Init segment and every media segment appended to one file.
    SingleFile(PathBuf),
    /// Init segment plus one file per segment. The template expands
    /// `$Number$` to the segment sequence number and `$Time$` to the
    /// segment start timestamp.
    Segmented {
        init_segment: PathBuf,
        segment_template: String,
    },
}

#[derive(Clone, Debug)]
pub struct Mp4MuxerOptions {
    pub output: Mp4Output,
    pub generate_sidx_in_media_segments: bool,
    pub include_pssh_in_stream: bool,
    /// Emit every subsegment as its own CMAF chunk inside the segment.
    pub low_latency_dash_mode: bool,
    pub initial_sequence_number: u32,
}

impl Mp4MuxerOptions {
    #[must_use]
    pub fn with_output(output: Mp4Output) -> Self {
        Self {
            output,
            generate_sidx_in_media_segments: false,
            include_pssh_in_stream: true,
            low_latency_dash_mode: false,
            initial_sequence_number: 1,
        }
    }
}

/// Terminal handler serializing one stream into fragmented MP4.
pub struct Mp4Muxer {
    base: HandlerBase,
    options: Mp4MuxerOptions,
    listener: Box<dyn MuxerListener>,
    info: Option<Arc<StreamInfo>>,
    pending_samples: Vec<MediaSample>,
    // Complete moof+mdat chunks of the segment being assembled.
    pending_chunks: Vec<u8>,
    sequence_number: u32,
    single_file: Option<std::fs::File>,
    total_duration: i64,
}

impl Mp4Muxer {
    #[must_use]
    pub fn new(options: Mp4MuxerOptions, listener: Box<dyn MuxerListener>) -> Self {
        let sequence_number = options.initial_sequence_number;
        Self {
            base: HandlerBase::new(),
            options,
            listener,
            info: None,
            pending_samples: Vec::new(),
            pending_chunks: Vec::new(),
            sequence_number,
            single_file: None,
            total_duration: 0,
        }
    }

    fn on_stream_info(&mut self, info: &Arc<StreamInfo>) -> Result<(), PipelineError> {
        if info.kind() == StreamKind::Text {
            return Err(PipelineError::InvalidArgument(
                "text streams go to the webvtt muxer".to_owned(),
            ));
        }
        self.listener.on_media_start(info);
        let init = render_init_segment(info, self.options.include_pssh_in_stream)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;

        match &self.options.output {
            Mp4Output::SingleFile(path) => {
                let mut file = std::fs::File::create(path)?;
                file.write_all(&init)?;
                self.single_file = Some(file);
            }
            Mp4Output::Segmented { init_segment, .. } => {
                std::fs::write(init_segment, &init)?;
            }
        }
        self.info = Some(info.clone());
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<(), PipelineError> {
        if self.pending_samples.is_empty() {
            return Ok(());
        }
        let info = self.info.as_ref().ok_or_else(|| {
            PipelineError::Internal("media sample before stream info".to_owned())
        })?;
        let samples = std::mem::take(&mut self.pending_samples);
        let fragment = render_fragment(info, &samples, self.sequence_number)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        self.sequence_number += 1;
        self.pending_chunks.extend_from_slice(&fragment);
        Ok(())
    }

    fn on_segment_info(&mut self, info: SegmentInfo) -> Result<(), PipelineError> {
        if info.is_subsegment {
            if self.options.low_latency_dash_mode {
                self.flush_chunk()?;
            }
            return Ok(());
        }
        self.flush_chunk()?;
        let chunks = std::mem::take(&mut self.pending_chunks);
        if chunks.is_empty() {
            return Ok(());
        }
        self.total_duration += info.duration;

        match &self.options.output {
            Mp4Output::SingleFile(path) => {
                let file = self.single_file.as_mut().ok_or_else(|| {
                    PipelineError::Internal("segment before init".to_owned())
                })?;
                file.write_all(&chunks)?;
                let name = path.display().to_string();
                self.listener.on_new_segment(
                    &name,
                    info.start_timestamp,
                    info.duration,
                    chunks.len().try_into().unwrap_or(u64::MAX),
                );
            }
            Mp4Output::Segmented {
                segment_template, ..
            } => {
                let stream_info = self.info.as_ref().expect("init was written");
                let mut segment = Vec::new();
                let styp = Boxes::new(Ftyp::media_segment());
                styp.marshal(&mut segment)
                    .map_err(|e| PipelineError::Internal(e.to_string()))?;
                if self.options.generate_sidx_in_media_segments {
                    let sidx = Boxes::new(Sidx {
                        full_box: FullBox {
                            version: 1,
                            flags: [0; 3],
                        },
                        reference_id: TRACK_ID,
                        timescale: stream_info.time_scale,
                        earliest_presentation_time: info
                            .start_timestamp
                            .try_into()
                            .unwrap_or_default(),
                        referenced_size: chunks.len().try_into().unwrap_or(u32::MAX),
                        subsegment_duration: info.duration.try_into().unwrap_or(u32::MAX),
                        starts_with_sap: true,
                    });
                    sidx.marshal(&mut segment)
                        .map_err(|e| PipelineError::Internal(e.to_string()))?;
                }
                segment.extend_from_slice(&chunks);

                let name = expand_segment_template(
                    segment_template,
                    self.sequence_number - 1,
                    info.start_timestamp,
                );
                std::fs::write(&name, &segment)?;
                self.listener.on_new_segment(
                    &name,
                    info.start_timestamp,
                    info.duration,
                    segment.len().try_into().unwrap_or(u64::MAX),
                );
            }
        }
        Ok(())
    }
}

impl MediaHandler for Mp4Muxer {
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
            StreamPayload::SegmentInfo(info) => self.on_segment_info(info),
            // Cues drive playlists, not the container.
            StreamPayload::Cue(_) | StreamPayload::Scte35(_) => Ok(()),
            StreamPayload::TextSample(_) => Err(PipelineError::InvalidArgument(
                "text samples in an mp4 muxer".to_owned(),
            )),
        }
    }

    fn on_flush_request(&mut self, _input_index: usize) -> Result<(), PipelineError> {
        // The chunker closes the last segment before flushing; anything
        // still pending is a stream without segment infos.
        self.flush_chunk()?;
        let chunks = std::mem::take(&mut self.pending_chunks);
        if !chunks.is_empty() {
            match &self.options.output {
                Mp4Output::SingleFile(_) => {
                    if let Some(file) = self.single_file.as_mut() {
                        file.write_all(&chunks)?;
                    }
                }
                Mp4Output::Segmented {
                    segment_template, ..
                } => {
                    let name =
                        expand_segment_template(segment_template, self.sequence_number - 1, 0);
                    std::fs::write(name, &chunks)?;
                }
            }
        }
        if let Some(file) = self.single_file.take() {
            file.sync_all()?;
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

fn codec_box_type(codec: Codec, encrypted: bool) -> Result<([u8; 4], [u8; 4]), Mp4Error> {
    // (sample entry type, codec configuration box type)
    let types = match codec {
        Codec::H264 => (*b"avc1", *b"avcC"),
        Codec::H265 => (*b"hvc1", *b"hvcC"),
        Codec::Vp9 => (*b"vp09", *b"vpcC"),
        Codec::Av1 => (*b"av01", *b"av1C"),
        Codec::Aac => (*b"mp4a", *b"esds"),
        Codec::Ac3 => (*b"ac-3", *b"dac3"),
        Codec::Ec3 => (*b"ec-3", *b"dec3"),
        other => {
            return Err(Mp4Error::Unsupported(format!(
                "codec {other:?} in mp4 output"
            )))
        }
    };
    if encrypted {
        let protected = if codec.is_video() { *b"encv" } else { *b"enca" };
        Ok((protected, types.1))
    } else {
        Ok(types)
    }
}

fn sample_entry(info: &StreamInfo) -> Result<Boxes, Mp4Error> {
    let encrypted = info.is_encrypted && info.encryption_config.is_some();
    let (entry_type, config_type) = codec_box_type(info.codec, encrypted)?;
    let (original_type, _) = codec_box_type(info.codec, false)?;

    let mut entry = match &info.details {
        common::StreamDetails::Video(v) => Boxes::new(VisualSampleEntry {
            typ: entry_type,
            data_reference_index: 1,
            width: u16::try_from(v.width).unwrap_or(u16::MAX),
            height: u16::try_from(v.height).unwrap_or(u16::MAX),
        }),
        common::StreamDetails::Audio(a) => Boxes::new(AudioSampleEntry {
            typ: entry_type,
            data_reference_index: 1,
            channel_count: u16::from(a.num_channels),
            sample_size: u16::from(a.sample_bits),
            // Fixed point 16.16; rates above 64 khz do not fit and are
            // written as 0 per ISO 14496-12.
            sample_rate: if a.sampling_frequency < 0x1_0000 {
                a.sampling_frequency << 16
            } else {
                0
            },
        }),
        common::StreamDetails::Text => {
            return Err(Mp4Error::Unsupported("text sample entry".to_owned()))
        }
    };

    if !info.codec_config.is_empty() {
        entry = entry.with_child(Boxes::new(RawBox {
            typ: config_type,
            data: info.codec_config.to_vec(),
        }));
    }

    if encrypted {
        let config = info.encryption_config.as_ref().expect("checked above");
        let pattern = config.crypt_byte_block > 0 || config.skip_byte_block > 0;
        let mut kid = [0_u8; 16];
        if config.key_id.len() == 16 {
            kid.copy_from_slice(&config.key_id);
        }
        entry = entry.with_child(
            Boxes::new(Sinf)
                .with_child(Boxes::new(crate::Frma {
                    data_format: original_type,
                }))
                .with_child(Boxes::new(Schm {
                    full_box: FullBox::default(),
                    scheme_type: config.protection_scheme.four_cc(),
                    scheme_version: 0x0001_0000,
                }))
                .with_child(Boxes::new(Schi).with_child(Boxes::new(Tenc {
                    full_box: FullBox {
                        version: u8::from(pattern),
                        flags: [0; 3],
                    },
                    crypt_byte_block: config.crypt_byte_block,
                    skip_byte_block: config.skip_byte_block,
                    default_is_protected: 1,
                    default_per_sample_iv_size: config.per_sample_iv_size,
                    default_kid: kid,
                    default_constant_iv: config.constant_iv.clone(),
                }))),
        );
    }
    Ok(entry)
}

pub fn render_init_segment(info: &StreamInfo, include_pssh: bool) -> Result<Vec<u8>, Mp4Error> {
    let duration = u64::try_from(info.duration.max(0)).unwrap_or(0);

    let (media_header, handler): (Boxes, Hdlr) = match info.kind() {
        StreamKind::Video => (Boxes::new(Vmhd), Hdlr::video()),
        StreamKind::Audio => (Boxes::new(Smhd), Hdlr::audio()),
        StreamKind::Text => return Err(Mp4Error::Unsupported("text init segment".to_owned())),
    };

    let (width, height) = match info.video() {
        Some(v) => (v.width << 16, v.height << 16),
        None => (0, 0),
    };

    let stbl = Boxes::new(Stbl)
        .with_child(
            Boxes::new(Stsd {
                full_box: FullBox::default(),
                entry_count: 1,
            })
            .with_child(sample_entry(info)?),
        )
        .with_children(vec![
            Boxes::new(EmptyTable { typ: *b"stts" }),
            Boxes::new(EmptyTable { typ: *b"stsc" }),
            Boxes::new(EmptyTable { typ: *b"stsz" }),
            Boxes::new(EmptyTable { typ: *b"stco" }),
        ]);

    let minf = Boxes::new(Minf)
        .with_child(media_header)
        .with_child(
            Boxes::new(crate::Dinf).with_child(
                Boxes::new(Dref {
                    full_box: FullBox::default(),
                    entry_count: 1,
                })
                .with_child(Boxes::new(Url::self_contained())),
            ),
        )
        .with_child(stbl);

    let trak = Boxes::new(crate::Trak)
        .with_child(Boxes::new(Tkhd {
            full_box: FullBox {
                version: 0,
                flags: u32_to_flags(TKHD_FLAG_ENABLED | TKHD_FLAG_IN_MOVIE),
            },
            track_id: TRACK_ID,
            duration,
            volume: if info.kind() == StreamKind::Audio {
                0x0100
            } else {
                0
            },
            width,
            height,
        }))
        .with_child(
            Boxes::new(crate::Mdia)
                .with_child(Boxes::new(Mdhd {
                    full_box: FullBox::default(),
                    timescale: info.time_scale,
                    duration,
                    language: pack_language(&info.language),
                }))
                .with_child(Boxes::new(handler))
                .with_child(minf),
        );

    let mut moov = Boxes::new(Moov)
        .with_child(Boxes::new(Mvhd {
            full_box: FullBox::default(),
            timescale: info.time_scale,
            duration,
            next_track_id: TRACK_ID + 1,
        }))
        .with_child(trak)
        .with_child(Boxes::new(Mvex).with_child(Boxes::new(Trex {
            full_box: FullBox::default(),
            track_id: TRACK_ID,
        })));

    if include_pssh {
        if let Some(config) = &info.encryption_config {
            for system in &config.key_system_info {
                moov = moov.with_child(Boxes::new(crate::PreSerializedBox {
                    typ: *b"pssh",
                    bytes: system.pssh_box.clone(),
                }));
            }
        }
    }

    let mut out = Vec::new();
    Boxes::new(Ftyp::init_segment()).marshal(&mut out)?;
    moov.marshal(&mut out)?;
    Ok(out)
}

// One moof+mdat pair.
pub fn render_fragment(
    info: &StreamInfo,
    samples: &[MediaSample],
    sequence_number: u32,
) -> Result<Vec<u8>, Mp4Error> {
    let encrypted = samples.iter().any(|s| s.decrypt_config.is_some());

    // The data offset and the saio offset depend on the final layout;
    // build the tree twice, sizes are identical both times.
    let probe = build_moof(info, samples, sequence_number, encrypted, 0, 0)?;
    let moof_size = probe.size();
    let data_offset = i32::try_from(moof_size + 8)
        .map_err(|e| Mp4Error::FromInt("data offset".to_owned(), e))?;
    let saio_offset = if encrypted {
        let traf_offset = probe
            .offset_of_child(*b"traf")
            .ok_or_else(|| Mp4Error::Parse("traf missing".to_owned()))?;
        let traf = &probe.children[1];
        let senc_offset = traf
            .offset_of_child(*b"senc")
            .ok_or_else(|| Mp4Error::Parse("senc missing".to_owned()))?;
        // Box header plus full box header plus sample count.
        u64::try_from(traf_offset + senc_offset + 16)
            .map_err(|e| Mp4Error::FromInt("saio offset".to_owned(), e))?
    } else {
        0
    };

    let moof = build_moof(
        info,
        samples,
        sequence_number,
        encrypted,
        data_offset,
        saio_offset,
    )?;
    debug_assert_eq!(moof_size, moof.size());

    let mdat = Boxes::new(Mdat {
        payloads: samples.iter().map(|s| s.data.clone()).collect(),
    });

    let mut out = Vec::with_capacity(moof.size() + mdat.size());
    moof.marshal(&mut out)?;
    mdat.marshal(&mut out)?;
    Ok(out)
}

fn build_moof(
    info: &StreamInfo,
    samples: &[MediaSample],
    sequence_number: u32,
    encrypted: bool,
    data_offset: i32,
    saio_offset: u64,
) -> Result<Boxes, Mp4Error> {
    let first_dts = samples.first().map_or(0, |s| s.dts);
    let base_media_decode_time = u64::try_from(first_dts.max(0)).unwrap_or(0);

    let mut trun_entries = Vec::with_capacity(samples.len());
    for sample in samples {
        let flags = if sample.is_key_frame {
            0
        } else {
            SAMPLE_FLAG_IS_NON_SYNC
        };
        trun_entries.push(TrunEntry {
            sample_duration: u32::try_from(sample.duration.max(0))
                .map_err(|e| Mp4Error::FromInt("sample duration".to_owned(), e))?,
            sample_size: u32::try_from(sample.data.len())
                .map_err(|e| Mp4Error::FromInt("sample size".to_owned(), e))?,
            sample_flags: flags,
            sample_composition_time_offset: i32::try_from(sample.pts - sample.dts)
                .map_err(|e| Mp4Error::FromInt("composition offset".to_owned(), e))?,
        });
    }

    let mut traf = Boxes::new(Traf)
        .with_child(Boxes::new(Tfhd {
            full_box: FullBox {
                version: 0,
                flags: u32_to_flags(TFHD_DEFAULT_BASE_IS_MOOF),
            },
            track_id: TRACK_ID,
        }))
        .with_child(Boxes::new(Tfdt {
            full_box: FullBox {
                version: 1,
                flags: [0; 3],
            },
            base_media_decode_time,
        }))
        .with_child(Boxes::new(Trun {
            full_box: FullBox {
                version: 1,
                flags: Trun::flags(),
            },
            data_offset,
            entries: trun_entries,
        }));

    if encrypted {
        let per_sample_iv_size = info
            .encryption_config
            .as_ref()
            .map_or(0, |c| c.per_sample_iv_size);
        let mut has_subsamples = false;
        let mut entries = Vec::with_capacity(samples.len());
        for sample in samples {
            let Some(config) = &sample.decrypt_config else {
                return Err(Mp4Error::Parse(
                    "mixed clear and encrypted samples in one fragment".to_owned(),
                ));
            };
            let iv = if per_sample_iv_size == 0 {
                Vec::new()
            } else {
                config.iv.clone()
            };
            let subsamples: Vec<(u16, u32)> = config
                .subsamples
                .iter()
                .map(|s| {
                    Ok((
                        u16::try_from(s.clear_bytes)
                            .map_err(|e| Mp4Error::FromInt("clear bytes".to_owned(), e))?,
                        s.cipher_bytes,
                    ))
                })
                .collect::<Result<_, Mp4Error>>()?;
            has_subsamples |= !subsamples.is_empty();
            entries.push(SencEntry { iv, subsamples });
        }

        let senc = Senc {
            full_box: FullBox {
                version: 0,
                flags: u32_to_flags(if has_subsamples { SENC_SUBSAMPLE_FLAG } else { 0 }),
            },
            entries,
        };
        let entry_sizes = senc.entry_sizes();
        let default_size = if entry_sizes.windows(2).all(|w| w[0] == w[1]) {
            entry_sizes.first().copied().unwrap_or(0)
        } else {
            0
        };
        traf = traf
            .with_child(Boxes::new(Saiz {
                full_box: FullBox::default(),
                default_sample_info_size: default_size,
                sample_count: u32::try_from(samples.len())
                    .map_err(|e| Mp4Error::FromInt("sample count".to_owned(), e))?,
                sample_info_sizes: if default_size == 0 {
                    entry_sizes
                } else {
                    Vec::new()
                },
            }))
            .with_child(Boxes::new(Saio {
                full_box: FullBox::default(),
                offset: saio_offset,
            }))
            .with_child(Boxes::new(senc));
    }

    Ok(Boxes::new(Moof)
        .with_child(Boxes::new(Mfhd {
            full_box: FullBox::default(),
            sequence_number,
        }))
        .with_child(traf))
}
