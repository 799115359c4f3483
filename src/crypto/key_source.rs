use crate::{pssh, IvGenerator};
use common::{EncryptionKey, PipelineError, ProtectionScheme, ProtectionSystem};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KeySourceError {
    #[error("no key configured for stream label '{0}'")]
    MissingStreamLabel(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("server: {0}")]
    Server(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("pssh: {0}")]
    Pssh(#[from] pssh::PsshError),
}

impl KeySourceError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, KeySourceError::TimedOut(_))
    }
}

impl From<KeySourceError> for PipelineError {
    fn from(e: KeySourceError) -> Self {
        match e {
            KeySourceError::Server(msg) => PipelineError::Server(msg),
            KeySourceError::TimedOut(msg) => PipelineError::TimedOut(msg),
            other => PipelineError::Encryption(other.to_string()),
        }
    }
}

/// Provider of content keys. Called concurrently from independent pipelines;
/// implementations must be reentrant or serialize internally.
pub trait KeySource: Send + Sync {
    /// Static key for the stream label.
    fn key(&self, stream_label: &str) -> Result<EncryptionKey, KeySourceError>;

    /// Rotated key for one crypto period. The mapping from period index to
    /// key id must be injective within a packaging run.
    fn crypto_period_key(
        &self,
        period_index: u32,
        period_duration_in_seconds: f64,
        stream_label: &str,
    ) -> Result<EncryptionKey, KeySourceError>;
}

/// Raw key material for one stream label.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawKeyPair {
    pub key_id: Vec<u8>,
    pub key: Vec<u8>,
}

/// In-memory key provider configuration. The empty stream label is the
/// default entry, used for labels without their own key.
#[derive(Clone, Debug, Default)]
pub struct RawKeyParams {
    pub key_map: BTreeMap<String, RawKeyPair>,
    /// Optional fixed iv. A random iv of the scheme's size is generated when
    /// absent.
    pub iv: Vec<u8>,
    /// One or more concatenated 'pssh' boxes to use verbatim. Systems
    /// covered here are not generated.
    pub pssh: Vec<u8>,
}

/// Key source over keys supplied directly in the packaging parameters.
pub struct RawKeySource {
    params: RawKeyParams,
    iv: Vec<u8>,
    key_system_info: Vec<common::KeySystemInfo>,
    generate_for: Vec<ProtectionSystem>,
}

impl RawKeySource {
    pub fn new(
        params: RawKeyParams,
        protection_systems: &HashSet<ProtectionSystem>,
        protection_scheme: ProtectionScheme,
        iv_generator: &dyn IvGenerator,
    ) -> Result<Self, KeySourceError> {
        for (label, pair) in &params.key_map {
            if pair.key_id.len() != common::KEY_ID_SIZE {
                return Err(KeySourceError::InvalidKey(format!(
                    "key id for label '{label}' must be 16 bytes, got {}",
                    pair.key_id.len()
                )));
            }
            if !matches!(pair.key.len(), 16 | 24 | 32) {
                return Err(KeySourceError::InvalidKey(format!(
                    "key for label '{label}' must be 16, 24 or 32 bytes, got {}",
                    pair.key.len()
                )));
            }
        }

        let iv = if params.iv.is_empty() {
            iv_generator.generate(crate::aes::iv_size_for_scheme(protection_scheme))
        } else {
            params.iv.clone()
        };

        // Supplied pssh boxes win; only uncovered systems are generated.
        let key_system_info = pssh::parse_concatenated_boxes(&params.pssh)?;
        let covered: HashSet<[u8; 16]> =
            key_system_info.iter().map(|info| info.system_id).collect();
        let generate_for = protection_systems
            .iter()
            .copied()
            .filter(|system| !covered.contains(&system.system_id()))
            .collect();

        Ok(Self {
            params,
            iv,
            key_system_info,
            generate_for,
        })
    }

    fn pair_for_label(&self, stream_label: &str) -> Result<&RawKeyPair, KeySourceError> {
        if let Some(pair) = self.params.key_map.get(stream_label) {
            return Ok(pair);
        }
        self.params
            .key_map
            .get("")
            .ok_or_else(|| KeySourceError::MissingStreamLabel(stream_label.to_owned()))
    }

    fn build_key(&self, pair: &RawKeyPair) -> Result<EncryptionKey, KeySourceError> {
        let mut key_system_info = self.key_system_info.clone();
        key_system_info.extend(pssh::generate_key_system_info(
            &self.generate_for,
            &pair.key_id,
            &pair.key,
        )?);
        Ok(EncryptionKey {
            key_id: pair.key_id.clone(),
            key: pair.key.clone(),
            iv: self.iv.clone(),
            key_system_info,
        })
    }
}

impl KeySource for RawKeySource {
    fn key(&self, stream_label: &str) -> Result<EncryptionKey, KeySourceError> {
        let pair = self.pair_for_label(stream_label)?;
        self.build_key(pair)
    }

    fn crypto_period_key(
        &self,
        period_index: u32,
        _period_duration_in_seconds: f64,
        stream_label: &str,
    ) -> Result<EncryptionKey, KeySourceError> {
        let base = self.pair_for_label(stream_label)?;
        // Raw keys have no server to rotate against; derive a per-period
        // pair by folding the period index into the trailing bytes. Distinct
        // periods yield distinct key ids.
        let pair = RawKeyPair {
            key_id: fold_period(&base.key_id, period_index),
            key: fold_period(&base.key, period_index),
        };
        self.build_key(&pair)
    }
}

fn fold_period(bytes: &[u8], period_index: u32) -> Vec<u8> {
    let mut out = bytes.to_vec();
    let len = out.len();
    for (i, b) in period_index.to_be_bytes().iter().enumerate() {
        out[len - 4 + i] ^= b;
    }
    out
}

/// Wraps a key source with a bounded retry loop for transient failures.
pub struct RetryingKeySource<S> {
    inner: S,
    max_attempts: u32,
}

impl<S: KeySource> RetryingKeySource<S> {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    #[must_use]
    pub fn new(inner: S, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
        }
    }

    fn with_retries<T>(
        &self,
        mut call: impl FnMut() -> Result<T, KeySourceError>,
    ) -> Result<T, KeySourceError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match call() {
                Err(e) if e.is_transient() && attempts < self.max_attempts => {}
                other => return other,
            }
        }
    }
}

impl<S: KeySource> KeySource for RetryingKeySource<S> {
    fn key(&self, stream_label: &str) -> Result<EncryptionKey, KeySourceError> {
        self.with_retries(|| self.inner.key(stream_label))
    }

    fn crypto_period_key(
        &self,
        period_index: u32,
        period_duration_in_seconds: f64,
        stream_label: &str,
    ) -> Result<EncryptionKey, KeySourceError> {
        self.with_retries(|| {
            self.inner
                .crypto_period_key(period_index, period_duration_in_seconds, stream_label)
        })
    }
}

/// Widevine license-server credentials. The network client lives outside
/// this crate; these types define the request signing surface.
#[derive(Clone, Debug, Default)]
pub struct WidevineSigner {
    pub signer_name: String,
    pub signing_key: WidevineSigningKey,
}

#[derive(Clone, Debug, Default)]
pub enum WidevineSigningKey {
    #[default]
    None,
    /// HMAC-SHA256 over the request body.
    Aes { key: Vec<u8>, iv: Vec<u8> },
    /// RSA-PSS over the request body.
    Rsa { private_key: String },
}

#[derive(Clone, Debug, Default)]
pub struct WidevineKeyServerParams {
    pub key_server_url: String,
    pub content_id: Vec<u8>,
    pub policy: String,
    pub signer: WidevineSigner,
    pub group_id: Vec<u8>,
    pub enable_entitlement_license: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PlayReadyKeyServerParams {
    pub key_server_url: String,
    pub program_identifier: String,
}
