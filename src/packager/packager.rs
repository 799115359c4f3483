// SPDX-License-Identifier: GPL-2.0-or-later

//! Pipeline assembly and job running: turn packaging parameters and stream
//! descriptors into handler graphs, drive one pipeline per input file, and
//! map the outcome to a process exit code.

pub mod config;
mod listener;
mod trick_play;

#[cfg(test)]
mod test;

pub use listener::*;
pub use trick_play::*;

use bytes::Bytes;
use chunking::{AdCueGenerator, AdCueGeneratorParams, ChunkingHandler, ChunkingParams};
use common::{
    ArcClock, ArcMsgLogger, LogLevel, MuxerListener, NullMuxerListener, PipelineError,
    ProtectionScheme, ProtectionSystem, StreamSelector, SystemClock,
};
use crypto::{
    EncryptionHandler, EncryptionOptions, IvGenerator, KeySource, PlayReadyKeyServerParams,
    RandomIvGenerator, RawKeyParams, RawKeySource, RetryingKeySource, StreamLabelFunc,
    WidevineKeyServerParams,
};
use mp4::{Mp4Demuxer, Mp4DemuxerOptions, Mp4Muxer, Mp4MuxerOptions, Mp4Output};
use pipeline::{add_handler, initialize, shared, OriginHandler, Replicator, SharedHandler};
use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use ts::{TsMuxer, TsMuxerOptions};
use webvtt::{TextPadder, WebVttMuxer, WebVttMuxerOptions, WebVttParser};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyProvider {
    #[default]
    None,
    Widevine,
    PlayReady,
    RawKey,
}

#[derive(Clone, Debug)]
pub struct EncryptionParams {
    pub key_provider: KeyProvider,
    pub raw_key: RawKeyParams,
    pub widevine: WidevineKeyServerParams,
    pub playready: PlayReadyKeyServerParams,
    pub protection_scheme: ProtectionScheme,
    pub clear_lead_in_seconds: f64,
    /// 0 disables key rotation.
    pub crypto_period_duration_in_seconds: f64,
    pub vp9_subsample_encryption: bool,
    pub protection_systems: HashSet<ProtectionSystem>,
}

impl Default for EncryptionParams {
    fn default() -> Self {
        Self {
            key_provider: KeyProvider::None,
            raw_key: RawKeyParams::default(),
            widevine: WidevineKeyServerParams::default(),
            playready: PlayReadyKeyServerParams::default(),
            protection_scheme: ProtectionScheme::Cenc,
            clear_lead_in_seconds: 0.0,
            crypto_period_duration_in_seconds: 0.0,
            vp9_subsample_encryption: true,
            protection_systems: HashSet::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Mp4OutputParams {
    pub generate_sidx_in_media_segments: bool,
    pub include_pssh_in_stream: bool,
    pub low_latency_dash_mode: bool,
    pub initial_sequence_number: u32,
}

impl Default for Mp4OutputParams {
    fn default() -> Self {
        Self {
            generate_sidx_in_media_segments: false,
            include_pssh_in_stream: true,
            low_latency_dash_mode: false,
            initial_sequence_number: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HlsPlaylistType {
    #[default]
    Vod,
    Event,
    Live,
}

/// HLS playlist parameters. Playlist serialization itself happens outside
/// this workspace; these feed the muxer listeners.
#[derive(Clone, Debug, Default)]
pub struct HlsParams {
    pub playlist_type: HlsPlaylistType,
    pub master_playlist_output: Option<PathBuf>,
    pub base_url: String,
    pub key_uri: String,
    pub time_shift_buffer_depth: f64,
    pub default_language: String,
}

/// DASH manifest parameters, carried for the manifest writer.
#[derive(Clone, Debug, Default)]
pub struct MpdParams {
    pub mpd_output: Option<PathBuf>,
    pub base_urls: Vec<String>,
    pub min_buffer_time: f64,
    pub time_shift_buffer_depth: f64,
    pub suggested_presentation_delay: f64,
    pub minimum_update_period: f64,
    pub default_language: String,
    pub generate_static_live_mpd: bool,
    pub generate_dash_if_iop_compliant_mpd: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PackagingParams {
    pub chunking: ChunkingParams,
    pub encryption: EncryptionParams,
    pub mp4_output: Mp4OutputParams,
    pub hls: HlsParams,
    pub mpd: MpdParams,
    pub ad_cues: AdCueGeneratorParams,
    /// Run all pipelines on the calling thread, for deterministic output.
    pub single_threaded: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerFormat {
    Mp4,
    Ts,
    WebVtt,
}

/// One input/output pairing.
#[derive(Clone, Debug)]
pub struct StreamDescriptor {
    pub input: PathBuf,
    pub stream_selector: StreamSelector,
    /// Single-file output. Mutually exclusive with `segment_template`.
    pub output: Option<PathBuf>,
    pub segment_template: Option<String>,
    pub init_segment: Option<PathBuf>,
    pub output_format: Option<ContainerFormat>,
    pub skip_encryption: bool,
    pub drm_label: Option<String>,
    /// 0 disables trick play.
    pub trick_play_factor: u32,
    pub bandwidth: u64,
    pub language: Option<String>,
    pub hls_name: Option<String>,
    pub hls_group_id: Option<String>,
    pub hls_playlist_name: Option<String>,
    pub hls_iframe_playlist_name: Option<String>,
    pub hls_characteristics: Vec<String>,
    pub dash_accessibilities: Vec<String>,
    pub dash_roles: Vec<String>,
    pub dash_label: Option<String>,
    pub dash_only: bool,
    pub hls_only: bool,
}

impl StreamDescriptor {
    #[must_use]
    pub fn new(input: impl Into<PathBuf>, stream_selector: StreamSelector) -> Self {
        Self {
            input: input.into(),
            stream_selector,
            output: None,
            segment_template: None,
            init_segment: None,
            output_format: None,
            skip_encryption: false,
            drm_label: None,
            trick_play_factor: 0,
            bandwidth: 0,
            language: None,
            hls_name: None,
            hls_group_id: None,
            hls_playlist_name: None,
            hls_iframe_playlist_name: None,
            hls_characteristics: Vec::new(),
            dash_accessibilities: Vec::new(),
            dash_roles: Vec::new(),
            dash_label: None,
            dash_only: false,
            hls_only: false,
        }
    }

    fn format(&self) -> Result<ContainerFormat, PipelineError> {
        if let Some(format) = self.output_format {
            return Ok(format);
        }
        let name = self
            .segment_template
            .clone()
            .or_else(|| self.output.as_ref().map(|p| p.display().to_string()))
            .unwrap_or_default();
        let extension = name.rsplit('.').next().unwrap_or_default().to_lowercase();
        match extension.as_str() {
            "mp4" | "m4s" | "m4v" | "m4a" | "cmfv" | "cmfa" => Ok(ContainerFormat::Mp4),
            "ts" => Ok(ContainerFormat::Ts),
            "vtt" | "webvtt" => Ok(ContainerFormat::WebVtt),
            other => Err(PipelineError::InvalidArgument(format!(
                "cannot infer output format from '{other}'"
            ))),
        }
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.output.is_none() && self.segment_template.is_none() {
            return Err(PipelineError::InvalidArgument(format!(
                "stream '{}' needs an output or a segment template",
                self.input.display()
            )));
        }
        if self.output.is_some() && self.segment_template.is_some() {
            return Err(PipelineError::InvalidArgument(
                "output and segment template are mutually exclusive".to_owned(),
            ));
        }
        if self.dash_only && self.hls_only {
            return Err(PipelineError::InvalidArgument(
                "a stream cannot be both dash-only and hls-only".to_owned(),
            ));
        }
        self.format().map(|_| ())
    }
}

/// Runtime collaborators injected into every pipeline.
pub struct RuntimeDeps {
    pub logger: ArcMsgLogger,
    pub clock: ArcClock,
    pub iv_generator: Arc<dyn IvGenerator>,
    /// Receives per-segment notifications of every muxer.
    pub media_info: Option<VodMediaInfoLog>,
}

impl Default for RuntimeDeps {
    fn default() -> Self {
        Self {
            logger: Arc::new(ConsoleLogger),
            clock: Arc::new(SystemClock),
            iv_generator: Arc::new(RandomIvGenerator),
            media_info: None,
        }
    }
}

/// Map a packaging result to the process exit code.
#[must_use]
pub fn exit_code(result: &Result<(), PipelineError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(PipelineError::InvalidArgument(_)) => 1,
        Err(PipelineError::Internal(_)) => 3,
        Err(_) => 2,
    }
}

/// Validate everything, build one pipeline per input file, run them to
/// completion and return the first failure.
pub fn run_packager(
    params: &PackagingParams,
    descriptors: &[StreamDescriptor],
    deps: &RuntimeDeps,
) -> Result<(), PipelineError> {
    params.chunking.validate()?;
    if descriptors.is_empty() {
        return Err(PipelineError::InvalidArgument(
            "no stream descriptors".to_owned(),
        ));
    }
    for descriptor in descriptors {
        descriptor.validate()?;
    }
    let key_source = build_key_source(&params.encryption, deps)?;

    // One job per input file.
    let mut jobs: BTreeMap<PathBuf, Vec<&StreamDescriptor>> = BTreeMap::new();
    for descriptor in descriptors {
        jobs.entry(descriptor.input.clone())
            .or_default()
            .push(descriptor);
    }

    let start = deps.clock.now_in_seconds();
    let mut origins = Vec::new();
    for (input, descriptors) in &jobs {
        origins.push(build_job(
            input,
            descriptors,
            params,
            key_source.clone(),
            deps,
        )?);
    }

    let result = if params.single_threaded || origins.len() == 1 {
        let mut result = Ok(());
        for origin in origins {
            let job_result = origin.lock().expect("poisoned origin").run();
            if result.is_ok() {
                result = job_result;
            }
        }
        result
    } else {
        let handles: Vec<_> = origins
            .into_iter()
            .map(|origin| {
                std::thread::spawn(move || origin.lock().expect("poisoned origin").run())
            })
            .collect();
        let mut result = Ok(());
        for handle in handles {
            let job_result = handle
                .join()
                .map_err(|_| PipelineError::Internal("pipeline thread panicked".to_owned()))?;
            if result.is_ok() {
                result = job_result;
            }
        }
        result
    };

    match &result {
        Ok(()) => {
            let elapsed = deps.clock.now_in_seconds().saturating_sub(start);
            deps.logger.log(
                LogLevel::Info,
                &format!("Packaging completed successfully in {elapsed} s."),
            );
        }
        Err(e) => deps.logger.log(LogLevel::Error, &format!("Packaging failed: {e}")),
    }
    result
}

type SharedOrigin = Arc<Mutex<dyn OriginHandler + Send>>;

fn build_key_source(
    params: &EncryptionParams,
    deps: &RuntimeDeps,
) -> Result<Option<Arc<dyn KeySource>>, PipelineError> {
    match params.key_provider {
        KeyProvider::None => Ok(None),
        KeyProvider::RawKey => {
            let source = RawKeySource::new(
                params.raw_key.clone(),
                &params.protection_systems,
                params.protection_scheme,
                deps.iv_generator.as_ref(),
            )
            .map_err(PipelineError::from)?;
            Ok(Some(Arc::new(RetryingKeySource::new(
                source,
                RetryingKeySource::<RawKeySource>::DEFAULT_MAX_ATTEMPTS,
            ))))
        }
        // The license-server clients live outside this workspace; only the
        // raw key provider is available in process.
        KeyProvider::Widevine | KeyProvider::PlayReady => Err(PipelineError::InvalidArgument(
            "this build packages with raw keys only".to_owned(),
        )),
    }
}

fn build_job(
    input: &PathBuf,
    descriptors: &[&StreamDescriptor],
    params: &PackagingParams,
    key_source: Option<Arc<dyn KeySource>>,
    deps: &RuntimeDeps,
) -> Result<SharedOrigin, PipelineError> {
    let data: Bytes = std::fs::read(input)?.into();

    let extension = input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match extension.as_str() {
        "mp4" | "mov" | "m4v" | "m4a" => {
            // Descriptors selecting the same stream share one demuxer
            // output and fan out behind a replicator.
            let mut groups: Vec<(StreamSelector, Vec<&StreamDescriptor>)> = Vec::new();
            for &descriptor in descriptors {
                match groups
                    .iter_mut()
                    .find(|(selector, _)| *selector == descriptor.stream_selector)
                {
                    Some((_, group)) => group.push(descriptor),
                    None => groups.push((descriptor.stream_selector, vec![descriptor])),
                }
            }

            let selectors: Vec<StreamSelector> =
                groups.iter().map(|(selector, _)| *selector).collect();
            let demuxer = Arc::new(Mutex::new(Mp4Demuxer::new(
                data,
                selectors,
                Mp4DemuxerOptions::default(),
            )));
            let as_handler: SharedHandler = demuxer.clone();
            for (_, group) in &groups {
                let chain = build_stream_chain(group, params, key_source.clone(), deps)?;
                add_handler(&as_handler, &chain)?;
            }
            initialize(&as_handler)?;
            Ok(demuxer)
        }
        "vtt" | "webvtt" => {
            if descriptors.len() != 1 {
                return Err(PipelineError::InvalidArgument(
                    "a webvtt input carries exactly one stream".to_owned(),
                ));
            }
            let parser = Arc::new(Mutex::new(WebVttParser::new(data)));
            let as_handler: SharedHandler = parser.clone();
            let chain = build_stream_chain(&[descriptors[0]], params, None, deps)?;
            add_handler(&as_handler, &chain)?;
            initialize(&as_handler)?;
            Ok(parser)
        }
        other => Err(PipelineError::UnsupportedStream(format!(
            "input container '{other}'"
        ))),
    }
}

// Demuxer output -> [trick play] -> [ad cues] -> [text padder] -> chunker
// -> [encryption] -> muxer(s). All descriptors in the group select the same
// stream; several of them fan out behind a replicator. Returns the head of
// the chain.
fn build_stream_chain(
    group: &[&StreamDescriptor],
    params: &PackagingParams,
    key_source: Option<Arc<dyn KeySource>>,
    deps: &RuntimeDeps,
) -> Result<SharedHandler, PipelineError> {
    let &descriptor = group.first().expect("groups are never empty");
    let mut handlers: Vec<SharedHandler> = Vec::new();

    if descriptor.trick_play_factor > 0 {
        handlers.push(shared(TrickPlayHandler::new(descriptor.trick_play_factor)));
    }
    if !params.ad_cues.cue_points.is_empty() {
        handlers.push(shared(AdCueGenerator::new(params.ad_cues.clone())));
    }
    if descriptor.format()? == ContainerFormat::WebVtt {
        handlers.push(shared(TextPadder::new()));
    }
    handlers.push(shared(ChunkingHandler::new(params.chunking.clone())));

    if let Some(key_source) = key_source {
        if !descriptor.skip_encryption {
            let label_func: Option<StreamLabelFunc> = descriptor.drm_label.clone().map(|label| {
                Arc::new(move |_: &crypto::EncryptedStreamAttributes| label.clone())
                    as StreamLabelFunc
            });
            handlers.push(shared(EncryptionHandler::new(
                EncryptionOptions {
                    protection_scheme: params.encryption.protection_scheme,
                    clear_lead_in_seconds: params.encryption.clear_lead_in_seconds,
                    crypto_period_duration_in_seconds: params
                        .encryption
                        .crypto_period_duration_in_seconds,
                    vp9_subsample_encryption: params.encryption.vp9_subsample_encryption,
                    stream_label_func: label_func,
                },
                key_source,
                deps.iv_generator.clone(),
                deps.logger.clone(),
            )));
        }
    }

    if group.len() == 1 {
        handlers.push(build_muxer(descriptor, params, deps)?);
    } else {
        let muxers = group
            .iter()
            .map(|&descriptor| build_muxer(descriptor, params, deps))
            .collect::<Result<Vec<_>, _>>()?;
        handlers.push(replicate_to(muxers)?);
    }

    pipeline::chain(&handlers)?;
    Ok(handlers.first().expect("chain is never empty").clone())
}

fn build_muxer(
    descriptor: &StreamDescriptor,
    params: &PackagingParams,
    deps: &RuntimeDeps,
) -> Result<SharedHandler, PipelineError> {
    let listener: Box<dyn MuxerListener> = match &deps.media_info {
        Some(log) => Box::new(VodMediaInfoListener::new(
            log.clone(),
            output_name(descriptor),
        )),
        None => Box::new(NullMuxerListener),
    };

    Ok(match descriptor.format()? {
        ContainerFormat::Mp4 => {
            let output = match (&descriptor.output, &descriptor.segment_template) {
                (Some(path), None) => Mp4Output::SingleFile(path.clone()),
                (None, Some(template)) => Mp4Output::Segmented {
                    init_segment: descriptor.init_segment.clone().ok_or_else(|| {
                        PipelineError::InvalidArgument(
                            "segmented mp4 output needs an init segment path".to_owned(),
                        )
                    })?,
                    segment_template: template.clone(),
                },
                _ => unreachable!("validated already"),
            };
            shared(Mp4Muxer::new(
                Mp4MuxerOptions {
                    output,
                    generate_sidx_in_media_segments: params
                        .mp4_output
                        .generate_sidx_in_media_segments,
                    include_pssh_in_stream: params.mp4_output.include_pssh_in_stream,
                    low_latency_dash_mode: params.mp4_output.low_latency_dash_mode,
                    initial_sequence_number: params.mp4_output.initial_sequence_number,
                },
                listener,
            ))
        }
        ContainerFormat::Ts => {
            let template = descriptor.segment_template.clone().ok_or_else(|| {
                PipelineError::InvalidArgument("ts output needs a segment template".to_owned())
            })?;
            shared(TsMuxer::new(
                TsMuxerOptions {
                    segment_template: template,
                },
                listener,
            ))
        }
        ContainerFormat::WebVtt => {
            let template = descriptor.segment_template.clone().ok_or_else(|| {
                PipelineError::InvalidArgument(
                    "webvtt output needs a segment template".to_owned(),
                )
            })?;
            shared(WebVttMuxer::new(
                WebVttMuxerOptions {
                    segment_template: template,
                },
                listener,
            ))
        }
    })
}

fn output_name(descriptor: &StreamDescriptor) -> String {
    descriptor
        .segment_template
        .clone()
        .or_else(|| descriptor.output.as_ref().map(|p| p.display().to_string()))
        .unwrap_or_default()
}

/// Fan one encrypted/chunked stream into several muxers. Wraps the muxers
/// behind a replicator; used when one stream feeds DASH and HLS outputs.
pub fn replicate_to(muxers: Vec<SharedHandler>) -> Result<SharedHandler, PipelineError> {
    let replicator = shared(Replicator::new());
    for muxer in &muxers {
        add_handler(&replicator, muxer)?;
    }
    Ok(replicator)
}

/// Logger printing to stdout, the application default.
pub struct ConsoleLogger;

impl common::MsgLogger for ConsoleLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("[{}] {msg}", level.name());
    }
}
