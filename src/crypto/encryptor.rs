use crate::{
    aes::{iv_size_for_scheme, AesCbcEncryptor, AesCtrCryptor, AesError, CbcIvRule, CbcPadding},
    IvGenerator, KeySource, SubsampleGenerator,
};
use common::{
    time::{seconds_to_ticks, ticks_to_seconds},
    ArcMsgLogger, Codec, DecryptConfig, EncryptionConfig, EncryptionKey, LogLevel, MediaSample,
    PipelineError, ProtectionScheme, SegmentInfo, StreamData, StreamInfo, StreamKind,
    StreamPayload, AES_BLOCK_SIZE, KEY_ID_SIZE,
};
use pipeline::{HandlerBase, MediaHandler};
use std::{collections::HashMap, sync::Arc};

/// Attributes a stream labeler may inspect to assign a key to a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncryptedStreamAttributes {
    Audio {
        num_channels: u8,
    },
    Video {
        width: u32,
        height: u32,
    },
    Text,
}

pub type StreamLabelFunc = Arc<dyn Fn(&EncryptedStreamAttributes) -> String + Send + Sync>;

/// The default labeler buckets video streams by resolution.
#[must_use]
pub fn default_stream_label(attributes: &EncryptedStreamAttributes) -> String {
    match attributes {
        EncryptedStreamAttributes::Audio { .. } => "AUDIO".to_owned(),
        EncryptedStreamAttributes::Text => "TEXT".to_owned(),
        EncryptedStreamAttributes::Video { width, height } => {
            let pixels = u64::from(*width) * u64::from(*height);
            if pixels <= 768 * 576 {
                "SD".to_owned()
            } else if pixels <= 2560 * 1440 {
                "HD".to_owned()
            } else if pixels <= 4096 * 2160 {
                "UHD1".to_owned()
            } else {
                "UHD2".to_owned()
            }
        }
    }
}

#[derive(Clone)]
pub struct EncryptionOptions {
    pub protection_scheme: ProtectionScheme,
    /// Duration from stream start during which samples pass through
    /// untouched. Rounds up to the next segment boundary: a segment is
    /// encrypted iff it starts at or after the clear lead.
    pub clear_lead_in_seconds: f64,
    /// 0 disables key rotation.
    pub crypto_period_duration_in_seconds: f64,
    pub vp9_subsample_encryption: bool,
    pub stream_label_func: Option<StreamLabelFunc>,
}

impl Default for EncryptionOptions {
    fn default() -> Self {
        Self {
            protection_scheme: ProtectionScheme::Cenc,
            clear_lead_in_seconds: 0.0,
            crypto_period_duration_in_seconds: 0.0,
            vp9_subsample_encryption: true,
            stream_label_func: None,
        }
    }
}

// Pattern for video tracks in the pattern schemes, per ISO/IEC 23001-7.
const PATTERN_CRYPT_BYTE_BLOCK: u8 = 1;
const PATTERN_SKIP_BYTE_BLOCK: u8 = 9;

enum SampleCryptor {
    Ctr(AesCtrCryptor),
    Cbc(AesCbcEncryptor),
}

impl SampleCryptor {
    fn new(scheme: ProtectionScheme, key: &[u8], iv: &[u8]) -> Result<Self, AesError> {
        if scheme.is_ctr() {
            Ok(SampleCryptor::Ctr(AesCtrCryptor::new(key, iv)?))
        } else {
            Ok(SampleCryptor::Cbc(AesCbcEncryptor::new(
                key,
                iv,
                CbcPadding::None,
                CbcIvRule::DontUseConstantIv,
            )?))
        }
    }

    fn iv(&self) -> Vec<u8> {
        match self {
            SampleCryptor::Ctr(c) => c.iv().to_vec(),
            SampleCryptor::Cbc(c) => c.iv().to_vec(),
        }
    }

    fn set_iv(&mut self, iv: &[u8]) -> Result<(), AesError> {
        match self {
            SampleCryptor::Ctr(c) => c.set_iv(iv),
            SampleCryptor::Cbc(c) => c.set_iv(iv),
        }
    }

    fn update_iv(&mut self) {
        match self {
            SampleCryptor::Ctr(c) => c.update_iv(),
            SampleCryptor::Cbc(c) => c.update_iv(),
        }
    }

    fn crypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), AesError> {
        match self {
            SampleCryptor::Ctr(c) => {
                c.crypt(input, output);
                Ok(())
            }
            SampleCryptor::Cbc(c) => c.crypt(input, output),
        }
    }
}

struct StreamState {
    info: Arc<StreamInfo>,
    label: String,
    time_scale: u32,
    clear_lead_end: i64,
    crypt_byte_block: u8,
    skip_byte_block: u8,
    per_sample_iv_size: u8,
    constant_iv: Vec<u8>,
    key: EncryptionKey,
    cryptor: Option<SampleCryptor>,
    segment_open: bool,
    segment_encrypted: bool,
    current_period: Option<u32>,
    queued_rotation: bool,
    // Text streams pass through untouched.
    passthrough: bool,
}

/// Applies a protection scheme to every stream passing through it: clear
/// lead handling, per-sample and subsample encryption, and periodic key
/// rotation announced on segment boundaries.
pub struct EncryptionHandler {
    base: HandlerBase,
    options: EncryptionOptions,
    key_source: Arc<dyn KeySource>,
    iv_generator: Arc<dyn IvGenerator>,
    subsample_generator: SubsampleGenerator,
    logger: ArcMsgLogger,
    streams: HashMap<usize, StreamState>,
}

impl EncryptionHandler {
    #[must_use]
    pub fn new(
        options: EncryptionOptions,
        key_source: Arc<dyn KeySource>,
        iv_generator: Arc<dyn IvGenerator>,
        logger: ArcMsgLogger,
    ) -> Self {
        let subsample_generator = SubsampleGenerator::new(options.vp9_subsample_encryption);
        Self {
            base: HandlerBase::new(),
            options,
            key_source,
            iv_generator,
            subsample_generator,
            logger,
            streams: HashMap::new(),
        }
    }

    fn rotation_enabled(&self) -> bool {
        self.options.crypto_period_duration_in_seconds > 0.0
    }

    fn stream_label(&self, info: &StreamInfo) -> String {
        let attributes = match &info.details {
            common::StreamDetails::Video(v) => EncryptedStreamAttributes::Video {
                width: v.width,
                height: v.height,
            },
            common::StreamDetails::Audio(a) => EncryptedStreamAttributes::Audio {
                num_channels: a.num_channels,
            },
            common::StreamDetails::Text => EncryptedStreamAttributes::Text,
        };
        match &self.options.stream_label_func {
            Some(f) => f(&attributes),
            None => default_stream_label(&attributes),
        }
    }

    fn pattern_for(&self, codec: Codec) -> (u8, u8) {
        // Audio always uses full sample encryption.
        if self.options.protection_scheme.is_pattern() && codec.is_video() {
            (PATTERN_CRYPT_BYTE_BLOCK, PATTERN_SKIP_BYTE_BLOCK)
        } else {
            (0, 0)
        }
    }

    fn on_stream_info(
        &mut self,
        stream_index: usize,
        info: &Arc<StreamInfo>,
    ) -> Result<(), PipelineError> {
        if info.kind() == StreamKind::Text {
            self.streams.insert(stream_index, passthrough_state(info));
            return self
                .base
                .dispatch_stream_info(stream_index, info.clone());
        }

        let scheme = self.options.protection_scheme;
        let label = self.stream_label(info);
        let (crypt_byte_block, skip_byte_block) = self.pattern_for(info.codec);

        let mut state = StreamState {
            info: info.clone(),
            label: label.clone(),
            time_scale: info.time_scale,
            clear_lead_end: seconds_to_ticks(self.options.clear_lead_in_seconds, info.time_scale),
            crypt_byte_block,
            skip_byte_block,
            per_sample_iv_size: 0,
            constant_iv: Vec::new(),
            key: EncryptionKey::default(),
            cryptor: None,
            segment_open: false,
            segment_encrypted: false,
            current_period: None,
            queued_rotation: false,
            passthrough: false,
        };

        let config = if self.rotation_enabled() {
            // The real key id rotates; announce a placeholder and carry the
            // rotating configs on segment infos.
            let iv = self.iv_generator.generate(iv_size_for_scheme(scheme));
            self.set_iv_fields(&mut state, &iv);
            EncryptionConfig {
                protection_scheme: scheme,
                key_id: vec![0; KEY_ID_SIZE],
                per_sample_iv_size: state.per_sample_iv_size,
                constant_iv: state.constant_iv.clone(),
                crypt_byte_block,
                skip_byte_block,
                key_system_info: Vec::new(),
            }
        } else {
            let key = self.key_source.key(&label)?;
            let iv = if key.iv.is_empty() {
                self.iv_generator.generate(iv_size_for_scheme(scheme))
            } else {
                key.iv.clone()
            };
            self.set_iv_fields(&mut state, &iv);
            state.cryptor = Some(
                SampleCryptor::new(scheme, &key.key, &iv)
                    .map_err(|e| PipelineError::Encryption(e.to_string()))?,
            );
            let config = EncryptionConfig {
                protection_scheme: scheme,
                key_id: key.key_id.clone(),
                per_sample_iv_size: state.per_sample_iv_size,
                constant_iv: state.constant_iv.clone(),
                crypt_byte_block,
                skip_byte_block,
                key_system_info: key.key_system_info.clone(),
            };
            state.key = key;
            config
        };

        let mut encrypted_info = (**info).clone();
        encrypted_info.is_encrypted = true;
        encrypted_info.encryption_config = Some(config);
        let encrypted_info = Arc::new(encrypted_info);
        state.info = encrypted_info.clone();

        self.logger.log(
            LogLevel::Debug,
            &format!("encrypting stream {stream_index} with label '{label}'"),
        );
        self.streams.insert(stream_index, state);
        self.base.dispatch_stream_info(stream_index, encrypted_info)
    }

    fn set_iv_fields(&self, state: &mut StreamState, iv: &[u8]) {
        match self.options.protection_scheme {
            ProtectionScheme::Cbcs | ProtectionScheme::SampleAes => {
                state.per_sample_iv_size = 0;
                state.constant_iv = iv.to_vec();
            }
            _ => {
                state.per_sample_iv_size =
                    u8::try_from(iv.len()).expect("iv is 8 or 16 bytes");
                state.constant_iv = Vec::new();
            }
        }
    }

    fn maybe_rotate_key(
        &mut self,
        stream_index: usize,
        segment_start: i64,
    ) -> Result<(), PipelineError> {
        if !self.rotation_enabled() {
            return Ok(());
        }
        let period_duration = self.options.crypto_period_duration_in_seconds;
        let state = self.streams.get_mut(&stream_index).expect("stream known");
        let seconds = ticks_to_seconds(segment_start.max(0), state.time_scale);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::as_conversions
        )]
        let period = (seconds / period_duration).floor() as u32;
        if state.current_period == Some(period) {
            return Ok(());
        }

        let key =
            self.key_source
                .crypto_period_key(period, period_duration, &state.label)?;
        let iv = if key.iv.is_empty() {
            self.iv_generator
                .generate(iv_size_for_scheme(self.options.protection_scheme))
        } else {
            key.iv.clone()
        };

        let state = self.streams.get_mut(&stream_index).expect("stream known");
        self.logger.log(
            LogLevel::Debug,
            &format!("stream {stream_index} rotating to crypto period {period}"),
        );
        match self.options.protection_scheme {
            ProtectionScheme::Cbcs | ProtectionScheme::SampleAes => {
                state.constant_iv = iv.clone();
            }
            _ => {}
        }
        state.cryptor = Some(
            SampleCryptor::new(self.options.protection_scheme, &key.key, &iv)
                .map_err(|e| PipelineError::Encryption(e.to_string()))?,
        );
        state.key = key;
        state.current_period = Some(period);
        state.queued_rotation = true;
        Ok(())
    }

    fn on_media_sample(
        &mut self,
        stream_index: usize,
        mut sample: MediaSample,
    ) -> Result<(), PipelineError> {
        let Some(state) = self.streams.get(&stream_index) else {
            return Err(PipelineError::Internal(format!(
                "media sample before stream info on stream {stream_index}"
            )));
        };
        if state.passthrough {
            return self.base.dispatch_media_sample(stream_index, sample);
        }

        if !state.segment_open {
            let segment_start = sample.dts;
            self.maybe_rotate_key(stream_index, segment_start)?;
            let state = self.streams.get_mut(&stream_index).expect("stream known");
            state.segment_open = true;
            state.segment_encrypted = segment_start >= state.clear_lead_end;
        }

        let state = self.streams.get_mut(&stream_index).expect("stream known");
        if !state.segment_encrypted {
            // Clear lead.
            return self.base.dispatch_media_sample(stream_index, sample);
        }

        let subsamples = self
            .subsample_generator
            .subsamples(&state.info, self.options.protection_scheme, &sample.data)
            .map_err(|e| PipelineError::Encryption(e.to_string()))?;

        let scheme = self.options.protection_scheme;
        let constant_iv = state.constant_iv.clone();
        let crypt_byte_block = state.crypt_byte_block;
        let skip_byte_block = state.skip_byte_block;
        let cryptor = state.cryptor.as_mut().expect("cryptor exists past clear lead");

        let sample_iv = if scheme.is_pattern() && !scheme.is_ctr() {
            constant_iv.clone()
        } else {
            cryptor.iv()
        };

        let mut encrypted = Vec::with_capacity(sample.data.len());
        let crypt_span = |cryptor: &mut SampleCryptor,
                          input: &[u8],
                          output: &mut Vec<u8>|
         -> Result<(), AesError> {
            if scheme.is_pattern() && !scheme.is_ctr() {
                // Each protected subsample chains anew from the constant iv.
                cryptor.set_iv(&constant_iv)?;
            }
            crypt_pattern(cryptor, crypt_byte_block, skip_byte_block, input, output)
        };

        let result: Result<(), AesError> = if subsamples.is_empty() {
            crypt_span(cryptor, &sample.data, &mut encrypted)
        } else {
            let mut pos = 0_usize;
            let mut result = Ok(());
            for entry in &subsamples {
                let clear = pos + usize::try_from(entry.clear_bytes).expect("span fits");
                encrypted.extend_from_slice(&sample.data[pos..clear]);
                let cipher = clear + usize::try_from(entry.cipher_bytes).expect("span fits");
                if entry.cipher_bytes > 0 {
                    result = crypt_span(cryptor, &sample.data[clear..cipher], &mut encrypted);
                    if result.is_err() {
                        break;
                    }
                }
                pos = cipher;
            }
            result
        };
        result.map_err(|e| PipelineError::Encryption(e.to_string()))?;

        match scheme {
            ProtectionScheme::Cbcs | ProtectionScheme::SampleAes => {}
            _ => cryptor.update_iv(),
        }

        sample.data = encrypted.into();
        sample.decrypt_config = Some(Box::new(DecryptConfig {
            key_id: state.key.key_id.clone(),
            iv: sample_iv,
            subsamples,
            protection_scheme: scheme,
            crypt_byte_block,
            skip_byte_block,
        }));
        self.base.dispatch_media_sample(stream_index, sample)
    }

    fn on_segment_info(
        &mut self,
        stream_index: usize,
        mut info: SegmentInfo,
    ) -> Result<(), PipelineError> {
        let Some(state) = self.streams.get_mut(&stream_index) else {
            return Err(PipelineError::Internal(format!(
                "segment info before stream info on stream {stream_index}"
            )));
        };
        if state.passthrough {
            return self.base.dispatch_segment_info(stream_index, info);
        }

        info.is_encrypted = if state.segment_open {
            state.segment_encrypted
        } else {
            // A segment that carried no samples.
            info.start_timestamp >= state.clear_lead_end
        };
        if state.queued_rotation {
            state.queued_rotation = false;
            info.key_rotation_encryption_config = Some(EncryptionConfig {
                protection_scheme: self.options.protection_scheme,
                key_id: state.key.key_id.clone(),
                per_sample_iv_size: state.per_sample_iv_size,
                constant_iv: state.constant_iv.clone(),
                crypt_byte_block: state.crypt_byte_block,
                skip_byte_block: state.skip_byte_block,
                key_system_info: state.key.key_system_info.clone(),
            });
        }
        state.segment_open = false;
        self.base.dispatch_segment_info(stream_index, info)
    }
}

fn passthrough_state(info: &Arc<StreamInfo>) -> StreamState {
    StreamState {
        info: info.clone(),
        label: String::new(),
        time_scale: info.time_scale,
        clear_lead_end: 0,
        crypt_byte_block: 0,
        skip_byte_block: 0,
        per_sample_iv_size: 0,
        constant_iv: Vec::new(),
        key: EncryptionKey::default(),
        cryptor: None,
        segment_open: false,
        segment_encrypted: false,
        current_period: None,
        queued_rotation: false,
        passthrough: true,
    }
}

// Apply the crypt:skip block pattern over one cipher span. With no pattern
// the whole span is one crypt call. Any run of trailing bytes short of one
// block stays clear, and skipped blocks do not advance the key stream.
fn crypt_pattern(
    cryptor: &mut SampleCryptor,
    crypt_byte_block: u8,
    skip_byte_block: u8,
    input: &[u8],
    output: &mut Vec<u8>,
) -> Result<(), AesError> {
    if crypt_byte_block == 0 && skip_byte_block == 0 {
        return cryptor.crypt(input, output);
    }
    let crypt_run = usize::from(crypt_byte_block) * AES_BLOCK_SIZE;
    let skip_run = usize::from(skip_byte_block) * AES_BLOCK_SIZE;

    let mut pos = 0;
    while pos < input.len() {
        let remaining = input.len() - pos;
        let aligned = remaining / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
        let crypt_size = crypt_run.min(aligned);
        if crypt_size == 0 {
            output.extend_from_slice(&input[pos..]);
            break;
        }
        cryptor.crypt(&input[pos..pos + crypt_size], output)?;
        pos += crypt_size;

        let skip_size = skip_run.min(input.len() - pos);
        output.extend_from_slice(&input[pos..pos + skip_size]);
        pos += skip_size;
    }
    Ok(())
}

impl MediaHandler for EncryptionHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn process(&mut self, data: StreamData) -> Result<(), PipelineError> {
        let stream_index = data.stream_index;
        match data.payload {
            StreamPayload::StreamInfo(info) => self.on_stream_info(stream_index, &info),
            StreamPayload::MediaSample(sample) => self.on_media_sample(stream_index, sample),
            StreamPayload::SegmentInfo(info) => self.on_segment_info(stream_index, info),
            // Text samples, cues and markers pass through untouched.
            other => self.base.dispatch(StreamData {
                stream_index,
                payload: other,
            }),
        }
    }
}
