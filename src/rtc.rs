//! The native real-time-communication engine binding.
//!
//! A foreign module (§9 "Native binding"): synchronous from the caller's
//! perspective, thread-safe, may block briefly. Modeled here as a trait so
//! [`crate::call::CallController`] never depends on the concrete FFI layer;
//! `FakeRtcBinding` drives the unit tests.

use crate::transcode::TranscodeSpec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Rtc,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Closed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDevice {
    Microphone,
    Camera,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Success,
    NotReady,
    ResyncNeeded,
}

/// Media description passed to `SetStreamSources`: the audio/video shell
/// commands the engine execs as its source, derived from a [`TranscodeSpec`].
#[derive(Debug, Clone)]
pub struct MediaDescription {
    pub audio_command: String,
    pub video_command: Option<String>,
}

impl From<&TranscodeSpec> for MediaDescription {
    fn from(spec: &TranscodeSpec) -> Self {
        Self {
            audio_command: spec.audio_command.clone(),
            video_command: spec.video_command.clone(),
        }
    }
}

/// DH parameters handed to `InitExchange`.
#[derive(Debug, Clone)]
pub struct DhParams {
    pub g: i32,
    pub p: Vec<u8>,
    pub random: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExchangeResult {
    pub g_a_or_b: Vec<u8>,
    pub key_fingerprint: i64,
}

/// The operations the native engine exposes per call, keyed by chat id.
/// All are synchronous/blocking-brief from the caller's point of view; the
/// controller wraps suspension-point-adjacent calls (join/connect) with
/// `tokio::time::timeout` rather than relying on the binding itself.
#[async_trait]
pub trait RtcBinding: Send + Sync {
    /// Builds the join payload for a new group call (`CreateCall`).
    async fn create_call(&self, chat_id: i64) -> crate::error::Result<String>;

    /// Establishes a new P2P call context (`CreateP2PCall`).
    async fn create_p2p_call(&self, chat_id: i64) -> crate::error::Result<()>;

    fn set_stream_sources(&self, chat_id: i64, media: MediaDescription) -> crate::error::Result<()>;

    /// Finalizes a group call join given the server's connection params
    /// JSON (`Connect`).
    async fn connect(&self, chat_id: i64, params_json: &str, is_presentation: bool) -> crate::error::Result<()>;

    /// Finalizes a P2P call (`ConnectP2P`).
    async fn connect_p2p(
        &self,
        chat_id: i64,
        servers: Vec<crate::messaging::RtcServer>,
        library_versions: Vec<String>,
        p2p_allowed: bool,
    ) -> crate::error::Result<()>;

    fn init_exchange(&self, chat_id: i64, dh: DhParams, g_a_or_b: Vec<u8>) -> crate::error::Result<Vec<u8>>;

    fn exchange_keys(&self, chat_id: i64, g_a_or_b: Vec<u8>, key_fingerprint: i64) -> crate::error::Result<ExchangeResult>;

    fn get_connection_mode(&self, chat_id: i64) -> crate::error::Result<ConnectionMode>;

    fn get_state(&self, chat_id: i64) -> crate::error::Result<Vec<u8>>;

    fn pause(&self, chat_id: i64) -> crate::error::Result<bool>;
    fn resume(&self, chat_id: i64) -> crate::error::Result<bool>;
    fn mute(&self, chat_id: i64) -> crate::error::Result<bool>;
    fn unmute(&self, chat_id: i64) -> crate::error::Result<bool>;
    fn time(&self, chat_id: i64) -> crate::error::Result<u64>;
    fn stop(&self, chat_id: i64) -> crate::error::Result<()>;

    fn add_incoming_video(&self, chat_id: i64, endpoint: &str, source_groups: Vec<u32>) -> crate::error::Result<()>;
    fn remove_incoming_video(&self, chat_id: i64, endpoint: &str) -> crate::error::Result<()>;

    async fn init_presentation(&self, chat_id: i64) -> crate::error::Result<String>;
    fn stop_presentation(&self, chat_id: i64) -> crate::error::Result<()>;

    fn send_broadcast_timestamp(&self, chat_id: i64, timestamp_ms: i64) -> crate::error::Result<()>;
    #[allow(clippy::too_many_arguments)]
    fn send_broadcast_part(
        &self,
        chat_id: i64,
        segment_id: i64,
        part_id: i64,
        status: SegmentStatus,
        quality_update: bool,
        data: Option<Vec<u8>>,
    ) -> crate::error::Result<()>;

    /// Used only by the test double to simulate the engine firing
    /// `OnStreamEnd`/`OnConnectionChange` callbacks.
    fn free(&self);
}

#[derive(Default)]
struct FakeState {
    sources: HashMap<i64, MediaDescription>,
    paused: HashMap<i64, bool>,
    connection_mode: HashMap<i64, ConnectionMode>,
}

/// An in-memory [`RtcBinding`] used by tests: every call succeeds
/// deterministically and records enough state for assertions.
pub struct FakeRtcBinding {
    state: Mutex<FakeState>,
    played_time: AtomicU64,
}

impl Default for FakeRtcBinding {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            played_time: AtomicU64::new(0),
        }
    }
}

impl FakeRtcBinding {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_played_time(&self, seconds: u64) {
        self.played_time.store(seconds, Ordering::SeqCst);
    }

    #[must_use]
    pub fn current_source(&self, chat_id: i64) -> Option<MediaDescription> {
        self.state.lock().unwrap().sources.get(&chat_id).cloned()
    }
}

#[async_trait]
impl RtcBinding for FakeRtcBinding {
    async fn create_call(&self, _chat_id: i64) -> crate::error::Result<String> {
        Ok("{}".to_string())
    }

    async fn create_p2p_call(&self, _chat_id: i64) -> crate::error::Result<()> {
        Ok(())
    }

    fn set_stream_sources(&self, chat_id: i64, media: MediaDescription) -> crate::error::Result<()> {
        self.state.lock().unwrap().sources.insert(chat_id, media);
        Ok(())
    }

    async fn connect(&self, chat_id: i64, _params_json: &str, _is_presentation: bool) -> crate::error::Result<()> {
        self.state
            .lock()
            .unwrap()
            .connection_mode
            .entry(chat_id)
            .or_insert(ConnectionMode::Rtc);
        Ok(())
    }

    async fn connect_p2p(
        &self,
        _chat_id: i64,
        _servers: Vec<crate::messaging::RtcServer>,
        _library_versions: Vec<String>,
        _p2p_allowed: bool,
    ) -> crate::error::Result<()> {
        Ok(())
    }

    fn init_exchange(&self, _chat_id: i64, _dh: DhParams, g_a_or_b: Vec<u8>) -> crate::error::Result<Vec<u8>> {
        if g_a_or_b.is_empty() {
            Ok(vec![0xAA; 8])
        } else {
            Ok(g_a_or_b)
        }
    }

    fn exchange_keys(&self, _chat_id: i64, g_a_or_b: Vec<u8>, _key_fingerprint: i64) -> crate::error::Result<ExchangeResult> {
        Ok(ExchangeResult {
            g_a_or_b,
            key_fingerprint: 42,
        })
    }

    fn get_connection_mode(&self, chat_id: i64) -> crate::error::Result<ConnectionMode> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .connection_mode
            .get(&chat_id)
            .copied()
            .unwrap_or(ConnectionMode::Rtc))
    }

    fn get_state(&self, _chat_id: i64) -> crate::error::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn pause(&self, chat_id: i64) -> crate::error::Result<bool> {
        self.state.lock().unwrap().paused.insert(chat_id, true);
        Ok(true)
    }

    fn resume(&self, chat_id: i64) -> crate::error::Result<bool> {
        self.state.lock().unwrap().paused.insert(chat_id, false);
        Ok(true)
    }

    fn mute(&self, _chat_id: i64) -> crate::error::Result<bool> {
        Ok(true)
    }

    fn unmute(&self, _chat_id: i64) -> crate::error::Result<bool> {
        Ok(true)
    }

    fn time(&self, _chat_id: i64) -> crate::error::Result<u64> {
        Ok(self.played_time.load(Ordering::SeqCst))
    }

    fn stop(&self, chat_id: i64) -> crate::error::Result<()> {
        self.state.lock().unwrap().sources.remove(&chat_id);
        Ok(())
    }

    fn add_incoming_video(&self, _chat_id: i64, _endpoint: &str, _source_groups: Vec<u32>) -> crate::error::Result<()> {
        Ok(())
    }

    fn remove_incoming_video(&self, _chat_id: i64, _endpoint: &str) -> crate::error::Result<()> {
        Ok(())
    }

    async fn init_presentation(&self, _chat_id: i64) -> crate::error::Result<String> {
        Ok("{}".to_string())
    }

    fn stop_presentation(&self, _chat_id: i64) -> crate::error::Result<()> {
        Ok(())
    }

    fn send_broadcast_timestamp(&self, _chat_id: i64, _timestamp_ms: i64) -> crate::error::Result<()> {
        Ok(())
    }

    fn send_broadcast_part(
        &self,
        _chat_id: i64,
        _segment_id: i64,
        _part_id: i64,
        _status: SegmentStatus,
        _quality_update: bool,
        _data: Option<Vec<u8>>,
    ) -> crate::error::Result<()> {
        Ok(())
    }

    fn free(&self) {}
}
