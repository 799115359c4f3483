// SPDX-License-Identifier: GPL-2.0-or-later

mod error;
mod sample;
mod stream;
pub mod time;

pub use error::*;
pub use sample::*;
pub use stream::*;

use std::sync::Arc;

/// Severity of a log message.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum LogLevel {
    /// Something requires attention.
    Error,

    /// Something may require attention.
    Warning,

    /// Standard information.
    Info,

    /// Verbose debugging information.
    Debug,
}

impl LogLevel {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

pub type ArcMsgLogger = Arc<dyn MsgLogger + Send + Sync>;

pub trait MsgLogger {
    fn log(&self, level: LogLevel, msg: &str);
}

pub struct DummyMsgLogger;

impl MsgLogger for DummyMsgLogger {
    fn log(&self, _: LogLevel, _: &str) {}
}

#[must_use]
pub fn new_dummy_msg_logger() -> ArcMsgLogger {
    Arc::new(DummyMsgLogger {})
}

/// Sink for muxer progress, driving manifest state elsewhere. Serialization
/// of manifests is outside this crate; muxers only report what they wrote.
pub trait MuxerListener: Send {
    fn on_media_start(&mut self, _info: &StreamInfo) {}

    fn on_new_segment(
        &mut self,
        _file_name: &str,
        _start_timestamp: i64,
        _duration: i64,
        _file_size: u64,
    ) {
    }

    fn on_media_end(&mut self, _media_duration: i64) {}
}

/// Listener that ignores everything.
pub struct NullMuxerListener;

impl MuxerListener for NullMuxerListener {}

pub type ArcClock = Arc<dyn Clock + Send + Sync>;

/// Wall clock injected into the pipeline so tests can pin time.
pub trait Clock {
    /// Seconds since the Unix epoch.
    fn now_in_seconds(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_in_seconds(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time went backwards")
            .as_secs()
    }
}

/// Clock that always reports zero, for deterministic test output.
pub struct ZeroClock;

impl Clock for ZeroClock {
    fn now_in_seconds(&self) -> u64 {
        0
    }
}
