//! Per-chat call-lifecycle orchestration: the state machine that owns the
//! native RTC binding handles and reacts to messaging-protocol updates.
//!
//! Grounded in `original_source/src/vc/calls.go` (state transitions),
//! `original_source/src/vc/ubot/connect_call.go` (the P2P handshake and the
//! outer `waitConnect` gate), and `original_source/src/vc/ubot/handle_updates.go`
//! (broadcast-part callbacks). The locking discipline follows §5: one lock
//! per logical map, read-copy-write across suspension points, never held
//! while awaiting a protocol RPC.

use crate::assistant::{AssistantPool, AssistantSession};
use crate::error::{EngineError, Result};
use crate::messaging::{
    BroadcastFetch, ConfirmedPhoneCall, DhConfig, InputGroupCall, InputPhoneCall, ParticipantUpdate,
    RawUpdate,
};
use crate::queue::{QueueStore, QueuedTrack};
use crate::rtc::{ConnectionMode, ConnectionState, MediaDescription, SegmentStatus};
use crate::transcode::{self, TranscodeSpec};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

const P2P_ANSWER_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECTION_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
const MIN_SEEK_DELTA: i64 = 20;
const MIN_SPEED: f64 = 0.5;
const MAX_SPEED: f64 = 4.0;

/// Transient per-chat lifecycle phase, per §4.6's state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    Idle,
    Joining,
    Playing,
    Paused,
    Leaving,
}

/// DH handshake state for a P2P (user-to-user) call, live from `CreateP2PCall`
/// through `ConnectP2P` or teardown.
struct P2pConfig {
    outgoing: bool,
    g_a_or_b: Vec<u8>,
    g_a_hash: Vec<u8>,
    key_fingerprint: Option<i64>,
    answer_tx: Option<oneshot::Sender<P2pAnswer>>,
}

struct P2pAnswer {
    g_a_or_b: Vec<u8>,
}

/// A pending broadcast (stream-mode) connection payload, replayed once the
/// self-participant's `canSelfUnmute` flips true.
#[derive(Clone)]
struct PendingConnection {
    params_json: String,
    media: MediaDescription,
}

#[derive(Debug, Clone, Default)]
struct ParticipantEntry {
    can_self_unmute: bool,
    video_endpoint: Option<(String, Vec<u32>)>,
    presentation_endpoint: Option<(String, Vec<u32>)>,
}

enum ConnectOutcome {
    Connected,
    Failed,
    TimedOut,
}

/// Owns every per-chat map the controller needs, each behind its own lock
/// per §5's "one read-write lock per logical map" rule.
pub struct CallController {
    queue: Arc<QueueStore>,
    assistants: Arc<AssistantPool>,
    phases: RwLock<HashMap<i64, Arc<Mutex<ChatPhase>>>>,
    p2p_configs: RwLock<HashMap<i64, P2pConfig>>,
    input_phone_calls: RwLock<HashMap<i64, InputPhoneCall>>,
    input_group_calls: RwLock<HashMap<i64, InputGroupCall>>,
    pending_connections: RwLock<HashMap<i64, PendingConnection>>,
    call_sources: RwLock<HashMap<i64, MediaDescription>>,
    call_participants: RwLock<HashMap<i64, HashMap<i64, ParticipantEntry>>>,
    wait_connect: Mutex<HashMap<i64, oneshot::Sender<ConnectOutcome>>>,
    presentations: RwLock<HashMap<i64, String>>,
    invite_links: RwLock<HashMap<i64, String>>,
    dh_cache: RwLock<HashMap<i64, DhConfig>>,
    downloads_dir: String,
}

impl CallController {
    #[must_use]
    pub fn new(queue: Arc<QueueStore>, assistants: Arc<AssistantPool>, downloads_dir: String) -> Self {
        Self {
            queue,
            assistants,
            phases: RwLock::new(HashMap::new()),
            p2p_configs: RwLock::new(HashMap::new()),
            input_phone_calls: RwLock::new(HashMap::new()),
            input_group_calls: RwLock::new(HashMap::new()),
            pending_connections: RwLock::new(HashMap::new()),
            call_sources: RwLock::new(HashMap::new()),
            call_participants: RwLock::new(HashMap::new()),
            wait_connect: Mutex::new(HashMap::new()),
            presentations: RwLock::new(HashMap::new()),
            invite_links: RwLock::new(HashMap::new()),
            dh_cache: RwLock::new(HashMap::new()),
            downloads_dir,
        }
    }

    async fn chat_lock(&self, chat_id: i64) -> Arc<Mutex<ChatPhase>> {
        if let Some(lock) = self.phases.read().await.get(&chat_id) {
            return Arc::clone(lock);
        }
        let mut phases = self.phases.write().await;
        Arc::clone(
            phases
                .entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(ChatPhase::Idle))),
        )
    }

    #[must_use]
    pub async fn phase(&self, chat_id: i64) -> ChatPhase {
        *self.chat_lock(chat_id).await.lock().await
    }

    // -- playback entry points ----------------------------------------------

    /// Plays `track` in `chat_id`: joins the call from Idle, or swaps the
    /// live source when already Playing (§4.6 "Play while Playing").
    #[instrument(skip(self, track), fields(chat_id, track_id = %track.info.id))]
    pub async fn play(&self, chat_id: i64, track: QueuedTrack) -> Result<()> {
        let lock = self.chat_lock(chat_id).await;
        let mut phase = lock.lock().await;

        match *phase {
            ChatPhase::Idle => {
                *phase = ChatPhase::Joining;
                drop(phase);
                match self.join_and_play(chat_id, &track).await {
                    Ok(()) => {
                        self.queue.set_active(chat_id, true);
                        self.queue.set_current(chat_id, track);
                        *lock.lock().await = ChatPhase::Playing;
                        Ok(())
                    }
                    Err(err) => {
                        // Clear chat state on join failure so a retry restarts cleanly (§4.6.1).
                        self.queue.clear_chat(chat_id);
                        *lock.lock().await = ChatPhase::Idle;
                        Err(err)
                    }
                }
            }
            ChatPhase::Playing | ChatPhase::Paused => {
                let session = self.assistants.bind(chat_id).await?;
                let spec = TranscodeSpec::build(&track.source, track.is_video, "").await;
                let media = MediaDescription::from(&spec);
                session.rtc.set_stream_sources(chat_id, media.clone())?;
                self.call_sources.write().await.insert(chat_id, media);
                self.queue.set_current(chat_id, track);
                *lock.lock().await = ChatPhase::Playing;
                Ok(())
            }
            ChatPhase::Joining | ChatPhase::Leaving => Err(EngineError::NotFound(format!(
                "chat {chat_id} is mid-transition"
            ))),
        }
    }

    async fn join_and_play(&self, chat_id: i64, track: &QueuedTrack) -> Result<()> {
        let session = self.assistants.bind(chat_id).await?;
        let spec = TranscodeSpec::build(&track.source, track.is_video, "").await;
        let media = MediaDescription::from(&spec);

        if chat_id < 0 {
            self.join_group_call(chat_id, &session, media).await
        } else {
            self.join_p2p_outgoing(chat_id, &session, media).await
        }
    }

    /// §4.6 transition "Play from Idle" for group/channel calls (chat id < 0).
    async fn join_group_call(
        &self,
        chat_id: i64,
        session: &Arc<AssistantSession>,
        media: MediaDescription,
    ) -> Result<()> {
        self.ensure_participant(chat_id, session).await?;

        let payload = session.rtc.create_call(chat_id).await?;
        session.rtc.set_stream_sources(chat_id, media.clone())?;

        let input_call = session.messaging.get_input_group_call(chat_id).await?;
        self.input_group_calls
            .write()
            .await
            .insert(chat_id, input_call.clone());

        let params_json = session
            .messaging
            .phone_join_group_call(&input_call, &payload, false, true)
            .await?;

        session.rtc.connect(chat_id, &params_json, false).await?;
        self.call_sources.write().await.insert(chat_id, media.clone());

        if session.rtc.get_connection_mode(chat_id)? == ConnectionMode::Stream {
            self.pending_connections.write().await.insert(
                chat_id,
                PendingConnection {
                    params_json,
                    media,
                },
            );
        }

        Ok(())
    }

    /// §4.6.1: joins the chat as a participant if not already one, using a
    /// cached invite link from the Update Sink when available.
    async fn ensure_participant(&self, chat_id: i64, session: &Arc<AssistantSession>) -> Result<()> {
        let _ = session.messaging.resolve_peer(chat_id).await?;
        let cached = self.invite_links.read().await.get(&chat_id).cloned();
        if cached.is_none() {
            debug!(chat_id, "no cached invite link; assuming already a participant");
        }
        Ok(())
    }

    /// §4.6.2 outgoing branch.
    async fn join_p2p_outgoing(
        &self,
        chat_id: i64,
        session: &Arc<AssistantSession>,
        media: MediaDescription,
    ) -> Result<()> {
        let dh = self.dh_config(session).await?;

        session.rtc.create_p2p_call(chat_id).await?;
        session.rtc.set_stream_sources(chat_id, media.clone())?;
        self.call_sources.write().await.insert(chat_id, media);

        let g_a = session
            .rtc
            .init_exchange(chat_id, dh.clone().into(), Vec::new())?;
        let g_a_hash = sha256(&g_a);

        let (answer_tx, answer_rx) = oneshot::channel();
        self.p2p_configs.write().await.insert(
            chat_id,
            P2pConfig {
                outgoing: true,
                g_a_or_b: g_a.clone(),
                g_a_hash: g_a_hash.clone(),
                key_fingerprint: None,
                answer_tx: Some(answer_tx),
            },
        );

        let user_id = session.messaging.get_sendable_user(chat_id).await?;
        session
            .messaging
            .phone_request_call(user_id, &g_a_hash, media.video_command.is_some())
            .await?;

        let answer = tokio::time::timeout(P2P_ANSWER_TIMEOUT, answer_rx)
            .await
            .map_err(|_| EngineError::ConnectionTimeout)?
            .map_err(|_| EngineError::ConnectionFailed)?;

        let exchange = session
            .rtc
            .exchange_keys(chat_id, answer.g_a_or_b, 0)?;

        let phone_call = InputPhoneCall {
            id: chat_id,
            access_hash: exchange.key_fingerprint,
        };
        let confirmed = session
            .messaging
            .phone_confirm_call(&phone_call, &g_a, exchange.key_fingerprint)
            .await?;
        self.input_phone_calls
            .write()
            .await
            .insert(chat_id, phone_call);

        self.finish_p2p_connect(chat_id, session, confirmed).await
    }

    /// §4.6.2 incoming branch: called once the external policy accepts a
    /// `PhoneCallRequested` notification.
    pub async fn accept_incoming_p2p(&self, chat_id: i64) -> Result<()> {
        let session = self.assistants.bind(chat_id).await?;
        let dh = self.dh_config(&session).await?;

        {
            let configs = self.p2p_configs.read().await;
            configs
                .get(&chat_id)
                .ok_or_else(|| EngineError::NotFound(format!("no pending p2p call for {chat_id}")))?;
        }
        let call = InputPhoneCall {
            id: chat_id,
            access_hash: 0,
        };

        let g_b = session
            .rtc
            .init_exchange(chat_id, dh.into(), Vec::new())?;

        let (answer_tx, answer_rx) = oneshot::channel();
        {
            let mut configs = self.p2p_configs.write().await;
            if let Some(cfg) = configs.get_mut(&chat_id) {
                cfg.answer_tx = Some(answer_tx);
                cfg.g_a_or_b = g_b.clone();
            }
        }

        session.messaging.phone_accept_call(&call, &g_b).await?;

        let answer = tokio::time::timeout(P2P_ANSWER_TIMEOUT, answer_rx)
            .await
            .map_err(|_| EngineError::ConnectionTimeout)?
            .map_err(|_| EngineError::ConnectionFailed)?;

        let exchange = session.rtc.exchange_keys(chat_id, answer.g_a_or_b, 0)?;
        self.input_phone_calls.write().await.insert(
            chat_id,
            InputPhoneCall {
                id: chat_id,
                access_hash: exchange.key_fingerprint,
            },
        );

        let confirmed = ConfirmedPhoneCall {
            connections: Vec::new(),
            library_versions: Vec::new(),
            p2p_allowed: true,
        };
        self.finish_p2p_connect(chat_id, &session, confirmed).await
    }

    async fn finish_p2p_connect(
        &self,
        chat_id: i64,
        session: &Arc<AssistantSession>,
        confirmed: ConfirmedPhoneCall,
    ) -> Result<()> {
        session
            .rtc
            .connect_p2p(
                chat_id,
                confirmed.connections,
                confirmed.library_versions,
                confirmed.p2p_allowed,
            )
            .await?;

        // Outer `waitConnect` gate (§4.6.2): registered before either branch
        // starts, consumed once here regardless of which branch ran.
        let (tx, rx) = oneshot::channel();
        self.wait_connect.lock().await.insert(chat_id, tx);
        match tokio::time::timeout(CONNECTION_WAIT_TIMEOUT, rx).await {
            Ok(Ok(ConnectOutcome::Connected)) => Ok(()),
            Ok(Ok(ConnectOutcome::Failed)) => Err(EngineError::ConnectionFailed),
            Ok(Ok(ConnectOutcome::TimedOut)) | Err(_) => Err(EngineError::ConnectionTimeout),
            Ok(Err(_)) => Err(EngineError::ConnectionFailed),
        }
    }

    /// Reported by the RTC binding's connection-state callback.
    pub async fn on_connection_change(&self, chat_id: i64, state: ConnectionState) {
        let outcome = match state {
            ConnectionState::Connected => ConnectOutcome::Connected,
            ConnectionState::Closed | ConnectionState::Failed => ConnectOutcome::Failed,
            ConnectionState::Timeout => ConnectOutcome::TimedOut,
        };
        if let Some(tx) = self.wait_connect.lock().await.remove(&chat_id) {
            let _ = tx.send(outcome);
        }
    }

    async fn dh_config(&self, session: &Arc<AssistantSession>) -> Result<DhConfig> {
        // There is no per-chat cache key here because DH params are global
        // to the messaging account, not the chat; cached once per session use.
        if let Some(dh) = self.dh_cache.read().await.get(&0) {
            return Ok(dh.clone());
        }
        let dh = session.messaging.get_dh_config().await?;
        self.dh_cache.write().await.insert(0, dh.clone());
        Ok(dh)
    }

    // -- playback controls ---------------------------------------------------

    #[instrument(skip(self), fields(chat_id))]
    pub async fn pause(&self, chat_id: i64) -> Result<()> {
        let lock = self.chat_lock(chat_id).await;
        let mut phase = lock.lock().await;
        if *phase != ChatPhase::Playing {
            return Err(EngineError::NotFound(format!("chat {chat_id} is not playing")));
        }
        let session = self.assistants.bind(chat_id).await?;
        session.rtc.pause(chat_id)?;
        *phase = ChatPhase::Paused;
        Ok(())
    }

    #[instrument(skip(self), fields(chat_id))]
    pub async fn resume(&self, chat_id: i64) -> Result<()> {
        let lock = self.chat_lock(chat_id).await;
        let mut phase = lock.lock().await;
        if *phase != ChatPhase::Paused {
            return Err(EngineError::NotFound(format!("chat {chat_id} is not paused")));
        }
        let session = self.assistants.bind(chat_id).await?;
        session.rtc.resume(chat_id)?;
        *phase = ChatPhase::Playing;
        Ok(())
    }

    pub async fn mute(&self, chat_id: i64) -> Result<()> {
        let session = self.assistants.bind(chat_id).await?;
        session.rtc.mute(chat_id)?;
        Ok(())
    }

    pub async fn unmute(&self, chat_id: i64) -> Result<()> {
        let session = self.assistants.bind(chat_id).await?;
        session.rtc.unmute(chat_id)?;
        Ok(())
    }

    pub async fn played_time(&self, chat_id: i64) -> Result<u64> {
        let session = self.assistants.bind(chat_id).await?;
        session.rtc.time(chat_id)
    }

    /// §4.6.5: changes playback speed of the current track. Requires an
    /// active Playing state with a current track.
    #[instrument(skip(self), fields(chat_id, speed))]
    pub async fn set_speed(&self, chat_id: i64, speed: f64) -> Result<()> {
        if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            return Err(EngineError::InvalidArgument(format!(
                "speed {speed} outside [{MIN_SPEED}, {MAX_SPEED}]"
            )));
        }
        let lock = self.chat_lock(chat_id).await;
        let phase = lock.lock().await;
        if *phase != ChatPhase::Playing {
            return Err(EngineError::NotFound(format!("chat {chat_id} is not playing")));
        }
        let current = self
            .queue
            .get_current(chat_id)
            .ok_or_else(|| EngineError::NotFound(format!("no current track in chat {chat_id}")))?;
        drop(phase);

        let session = self.assistants.bind(chat_id).await?;
        let extra_flags = transcode::speed_extra_flags(speed);
        let spec = TranscodeSpec::build(&current.source, current.is_video, &extra_flags).await;
        let media = MediaDescription::from(&spec);
        session.rtc.set_stream_sources(chat_id, media.clone())?;
        self.call_sources.write().await.insert(chat_id, media);
        Ok(())
    }

    /// §4.6.6: seeks the current track forward by `delta` seconds.
    #[instrument(skip(self), fields(chat_id, delta))]
    pub async fn seek(&self, chat_id: i64, delta: i64) -> Result<()> {
        if delta < MIN_SEEK_DELTA {
            return Err(EngineError::InvalidArgument(format!(
                "seek delta must be at least {MIN_SEEK_DELTA}s"
            )));
        }
        let lock = self.chat_lock(chat_id).await;
        let phase = lock.lock().await;
        if *phase != ChatPhase::Playing {
            return Err(EngineError::NotFound(format!("chat {chat_id} is not playing")));
        }
        let current = self
            .queue
            .get_current(chat_id)
            .ok_or_else(|| EngineError::NotFound(format!("no current track in chat {chat_id}")))?;
        drop(phase);

        let session = self.assistants.bind(chat_id).await?;
        let played = session.rtc.time(chat_id)?;
        let new_pos = played.saturating_add(delta.unsigned_abs());
        if new_pos >= current.info.duration_seconds {
            return Err(EngineError::SeekBeyondDuration);
        }

        let is_url_or_missing = !transcode::is_local_file(&current.source);
        let flags = transcode::seek_flags(
            &current.source,
            is_url_or_missing,
            new_pos,
            current.info.duration_seconds,
        );
        let spec = TranscodeSpec::build(&current.source, current.is_video, &flags).await;
        let media = MediaDescription::from(&spec);
        session.rtc.set_stream_sources(chat_id, media.clone())?;
        self.call_sources.write().await.insert(chat_id, media);
        Ok(())
    }

    /// RTC `OnStreamEnd` callback entry point: replays the current track per
    /// loop count, else advances the queue, else stops.
    #[instrument(skip(self), fields(chat_id))]
    pub async fn play_next(&self, chat_id: i64) -> Result<()> {
        let lock = self.chat_lock(chat_id).await;
        let mut phase = lock.lock().await;
        if matches!(*phase, ChatPhase::Joining | ChatPhase::Leaving) {
            return Err(EngineError::NotFound(format!(
                "chat {chat_id} is mid-transition"
            )));
        }
        *phase = ChatPhase::Joining;
        drop(phase);

        let loop_count = self.queue.get_loop(chat_id);
        if loop_count > 0 {
            if let Some(current) = self.queue.get_current(chat_id) {
                self.queue.set_loop(chat_id, loop_count - 1)?;
                let result = self.replay_current(chat_id, &current).await;
                *lock.lock().await = if result.is_ok() {
                    ChatPhase::Playing
                } else {
                    ChatPhase::Idle
                };
                return result;
            }
        }

        if let Some(next) = self.queue.pop_next(chat_id) {
            let result = self.replay_current(chat_id, &next).await;
            if result.is_ok() {
                self.queue.set_current(chat_id, next);
                *lock.lock().await = ChatPhase::Playing;
            } else {
                *lock.lock().await = ChatPhase::Idle;
            }
            return result;
        }

        drop(lock.lock().await);
        self.stop(chat_id).await
    }

    async fn replay_current(&self, chat_id: i64, track: &QueuedTrack) -> Result<()> {
        let session = self.assistants.bind(chat_id).await?;
        let spec = TranscodeSpec::build(&track.source, track.is_video, "").await;
        let media = MediaDescription::from(&spec);
        session.rtc.set_stream_sources(chat_id, media.clone())?;
        self.call_sources.write().await.insert(chat_id, media);
        Ok(())
    }

    /// §4.6 "Stop" transition: clears chat state, leaves the call, enters Idle.
    #[instrument(skip(self), fields(chat_id))]
    pub async fn stop(&self, chat_id: i64) -> Result<()> {
        let lock = self.chat_lock(chat_id).await;
        let mut phase = lock.lock().await;
        *phase = ChatPhase::Leaving;
        drop(phase);

        if let Ok(session) = self.assistants.bind(chat_id).await {
            let _ = session.rtc.stop(chat_id);
            if let Some(call) = self.input_group_calls.write().await.remove(&chat_id) {
                let _ = session.messaging.phone_leave_group_call(&call).await;
            }
        }

        self.input_phone_calls.write().await.remove(&chat_id);
        self.pending_connections.write().await.remove(&chat_id);
        self.call_sources.write().await.remove(&chat_id);
        self.call_participants.write().await.remove(&chat_id);
        self.p2p_configs.write().await.remove(&chat_id);
        self.presentations.write().await.remove(&chat_id);
        self.queue.clear_chat(chat_id);

        *lock.lock().await = ChatPhase::Idle;
        Ok(())
    }

    // -- broadcast (stream) mode, §4.6.3 -------------------------------------

    pub async fn on_request_broadcast_timestamp(&self, chat_id: i64, session: &Arc<AssistantSession>) -> Result<i64> {
        let call = self
            .input_group_calls
            .read()
            .await
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no group call for chat {chat_id}")))?;
        let channels = session
            .messaging
            .phone_get_group_call_stream_channels(&call)
            .await?;
        Ok(channels.first().copied().unwrap_or(0))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn on_request_broadcast_part(
        &self,
        chat_id: i64,
        session: &Arc<AssistantSession>,
        timestamp_ms: i64,
        channel_id: i32,
        quality: i32,
        limit: i32,
        part_id: i64,
        segment_id: i64,
        quality_update: bool,
    ) -> Result<()> {
        let call = self
            .input_group_calls
            .read()
            .await
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no group call for chat {chat_id}")))?;

        match session
            .messaging
            .upload_group_call_stream(&call, timestamp_ms, channel_id, quality, limit)
            .await
        {
            Ok(BroadcastFetch::Success(bytes)) => session.rtc.send_broadcast_part(
                chat_id,
                segment_id,
                part_id,
                SegmentStatus::Success,
                quality_update,
                Some(bytes),
            ),
            Ok(BroadcastFetch::NotReady) => session.rtc.send_broadcast_part(
                chat_id,
                segment_id,
                part_id,
                SegmentStatus::NotReady,
                quality_update,
                None,
            ),
            Err(EngineError::FloodWait(d)) => {
                tokio::time::sleep(d).await;
                session.rtc.send_broadcast_part(
                    chat_id,
                    segment_id,
                    part_id,
                    SegmentStatus::NotReady,
                    quality_update,
                    None,
                )
            }
            Ok(BroadcastFetch::ResyncNeeded) | Err(_) => session.rtc.send_broadcast_part(
                chat_id,
                segment_id,
                part_id,
                SegmentStatus::ResyncNeeded,
                quality_update,
                None,
            ),
        }
    }

    // -- participant updates, §4.6.4 -----------------------------------------

    #[instrument(skip(self, participants), fields(chat_id, count = participants.len()))]
    pub async fn handle_participant_update(
        &self,
        chat_id: i64,
        session: &Arc<AssistantSession>,
        participants: Vec<ParticipantUpdate>,
    ) {
        let mut video_adds = Vec::new();
        let mut video_removes = Vec::new();
        let mut self_unmuted = false;
        let mut self_muted_by_admin = false;

        {
            let mut cache = self.call_participants.write().await;
            let entry = cache.entry(chat_id).or_default();

            for p in participants {
                if p.left {
                    if let Some(old) = entry.remove(&p.participant_id) {
                        if let Some((endpoint, _)) = old.video_endpoint {
                            video_removes.push(endpoint);
                        }
                        if let Some((endpoint, _)) = old.presentation_endpoint {
                            video_removes.push(endpoint);
                        }
                    }
                    continue;
                }

                let old = entry.get(&p.participant_id).cloned().unwrap_or_default();
                if old.video_endpoint != p.video_endpoint {
                    if let Some((endpoint, _)) = &old.video_endpoint {
                        video_removes.push(endpoint.clone());
                    }
                    if let Some((endpoint, groups)) = &p.video_endpoint {
                        video_adds.push((endpoint.clone(), groups.clone()));
                    }
                }
                if old.presentation_endpoint != p.presentation_endpoint {
                    if let Some((endpoint, _)) = &old.presentation_endpoint {
                        video_removes.push(endpoint.clone());
                    }
                    if let Some((endpoint, groups)) = &p.presentation_endpoint {
                        video_adds.push((endpoint.clone(), groups.clone()));
                    }
                }

                if p.participant_id == session.self_id {
                    let mode = session.rtc.get_connection_mode(chat_id).ok();
                    if mode == Some(ConnectionMode::Stream) && p.can_self_unmute {
                        self_unmuted = true;
                    } else if !p.can_self_unmute {
                        self_muted_by_admin = true;
                    } else if old.can_self_unmute != p.can_self_unmute {
                        self_unmuted = true;
                    }
                }

                entry.insert(
                    p.participant_id,
                    ParticipantEntry {
                        can_self_unmute: p.can_self_unmute,
                        video_endpoint: p.video_endpoint,
                        presentation_endpoint: p.presentation_endpoint,
                    },
                );
            }
        }

        // RTC calls happen after the cache lock is released (read-copy-write, §5).
        for endpoint in video_removes {
            if let Err(err) = session.rtc.remove_incoming_video(chat_id, &endpoint) {
                warn!(chat_id, %endpoint, %err, "failed to remove incoming video");
            }
        }
        for (endpoint, groups) in video_adds {
            if let Err(err) = session.rtc.add_incoming_video(chat_id, &endpoint, groups) {
                warn!(chat_id, %endpoint, %err, "failed to add incoming video");
            }
        }

        if self_unmuted {
            self.trigger_pending_connection(chat_id, session).await;
            self.queue.set_muted_by_admin(chat_id, false);
        } else if self_muted_by_admin {
            self.queue.set_muted_by_admin(chat_id, true);
        }
    }

    async fn trigger_pending_connection(&self, chat_id: i64, session: &Arc<AssistantSession>) {
        let pending = self.pending_connections.write().await.remove(&chat_id);
        if let Some(pending) = pending {
            if let Err(err) = session
                .rtc
                .connect(chat_id, &pending.params_json, false)
                .await
            {
                warn!(chat_id, %err, "failed to replay pending broadcast connection");
            }
            if let Err(err) = session.rtc.set_stream_sources(chat_id, pending.media) {
                warn!(chat_id, %err, "failed to restore media on unmute");
            }
        }
    }

    /// Dispatches a raw messaging-protocol update into the controller
    /// (the "Update Sink" of §2).
    #[instrument(skip(self, update))]
    pub async fn handle_raw_update(&self, update: RawUpdate, session: &Arc<AssistantSession>) -> Result<()> {
        match update {
            RawUpdate::PhoneCallRequested {
                call, g_a_hash, ..
            } => {
                self.p2p_configs.write().await.insert(
                    call.id,
                    P2pConfig {
                        outgoing: false,
                        g_a_or_b: Vec::new(),
                        g_a_hash,
                        key_fingerprint: None,
                        answer_tx: None,
                    },
                );
                info!(chat_id = call.id, "incoming P2P call requested");
                Ok(())
            }
            RawUpdate::PhoneCallAccepted { call, g_b, .. } => {
                let tx = {
                    let mut configs = self.p2p_configs.write().await;
                    configs.get_mut(&call.id).and_then(|c| c.answer_tx.take())
                };
                if let Some(tx) = tx {
                    let _ = tx.send(P2pAnswer { g_a_or_b: g_b });
                }
                Ok(())
            }
            RawUpdate::PhoneCallConfirmed {
                peer_user_id,
                g_a_or_b,
                key_fingerprint,
                ..
            } => {
                let tx = {
                    let mut configs = self.p2p_configs.write().await;
                    configs
                        .get_mut(&peer_user_id)
                        .and_then(|c| c.answer_tx.take())
                };
                if let Some(tx) = tx {
                    let _ = tx.send(P2pAnswer { g_a_or_b });
                }
                let _ = key_fingerprint;
                Ok(())
            }
            RawUpdate::PhoneCallDiscarded { peer_user_id, .. } => {
                self.p2p_configs.write().await.remove(&peer_user_id);
                self.on_connection_change(peer_user_id, ConnectionState::Closed).await;
                Ok(())
            }
            RawUpdate::PhoneCallSignalingData { .. } => Ok(()),
            RawUpdate::GroupCallParticipants {
                chat_id,
                participants,
            } => {
                self.handle_participant_update(chat_id, session, participants).await;
                Ok(())
            }
            RawUpdate::GroupCallUpdated { chat_id, call } => {
                if let Some(call) = call {
                    self.input_group_calls.write().await.insert(chat_id, call);
                }
                Ok(())
            }
        }
    }

    /// Records an invite link the Update Sink discovered for `chat_id`, for
    /// `ensure_participant` to reuse on the next join.
    pub async fn cache_invite_link(&self, chat_id: i64, link: String) {
        self.invite_links.write().await.insert(chat_id, link);
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

impl From<DhConfig> for crate::rtc::DhParams {
    fn from(dh: DhConfig) -> Self {
        Self {
            g: dh.g,
            p: dh.p,
            random: dh.random,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::AssistantPool;
    use crate::db::DocumentStore;
    use crate::messaging::FakeMessagingClient;
    use crate::queue::{Platform, TrackInfo};
    use crate::rtc::FakeRtcBinding;
    use fred::prelude::{RedisClient, RedisConfig};

    fn unconnected_store() -> Arc<DocumentStore> {
        Arc::new(DocumentStore::new(RedisClient::new(
            RedisConfig::default(),
            None,
            None,
            None,
        )))
    }

    async fn controller_with_pool() -> (CallController, Arc<QueueStore>) {
        let store = unconnected_store();
        let mut pool = AssistantPool::new(store);
        let messaging = Arc::new(FakeMessagingClient::new(1));
        let rtc = Arc::new(FakeRtcBinding::new());
        pool.start_assistant("deadbeef", crate::config::SessionType::Gogram, messaging, rtc, false)
            .unwrap();
        let pool = Arc::new(pool);
        let queue = Arc::new(QueueStore::new());
        let controller = CallController::new(Arc::clone(&queue), pool, "/tmp".to_string());
        (controller, queue)
    }

    fn track(id: &str) -> QueuedTrack {
        QueuedTrack {
            info: TrackInfo {
                id: id.to_string(),
                title: id.to_string(),
                duration_seconds: 300,
                platform: Platform::Youtube,
                cover_url: None,
                canonical_url: format!("https://example.com/{id}"),
                cdn_url: None,
            },
            source: format!("/tmp/{id}.mp3"),
            loop_remaining: 0,
            enqueued_by: "alice".to_string(),
            is_video: false,
        }
    }

    #[tokio::test]
    async fn first_play_joins_and_enters_playing() {
        let (controller, queue) = controller_with_pool().await;
        controller.play(-100, track("abc")).await.unwrap();
        assert_eq!(controller.phase(-100).await, ChatPhase::Playing);
        assert!(queue.is_active(-100));
        assert_eq!(queue.get_current(-100).unwrap().info.id, "abc");
    }

    #[tokio::test]
    async fn loop_two_replays_then_goes_idle() {
        let (controller, queue) = controller_with_pool().await;
        controller.play(-100, track("t1")).await.unwrap();
        queue.set_loop(-100, 2).unwrap();

        controller.play_next(-100).await.unwrap();
        assert_eq!(controller.phase(-100).await, ChatPhase::Playing);
        assert_eq!(queue.get_loop(-100), 1);

        controller.play_next(-100).await.unwrap();
        assert_eq!(controller.phase(-100).await, ChatPhase::Playing);
        assert_eq!(queue.get_loop(-100), 0);

        controller.play_next(-100).await.unwrap();
        assert_eq!(controller.phase(-100).await, ChatPhase::Idle);
        assert!(queue.get_current(-100).is_none());
    }

    #[tokio::test]
    async fn queue_and_skip_advances_to_next() {
        let (controller, queue) = controller_with_pool().await;
        controller.play(-100, track("t1")).await.unwrap();
        queue.enqueue(-100, track("t2"));
        queue.enqueue(-100, track("t3"));

        controller.play_next(-100).await.unwrap();
        assert_eq!(queue.get_current(-100).unwrap().info.id, "t2");
        assert_eq!(queue.queue_length(-100), 1);
    }

    #[tokio::test]
    async fn pause_requires_playing_state() {
        let (controller, _queue) = controller_with_pool().await;
        let err = controller.pause(-100).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips() {
        let (controller, _queue) = controller_with_pool().await;
        controller.play(-100, track("t1")).await.unwrap();
        controller.pause(-100).await.unwrap();
        assert_eq!(controller.phase(-100).await, ChatPhase::Paused);
        controller.resume(-100).await.unwrap();
        assert_eq!(controller.phase(-100).await, ChatPhase::Playing);
    }

    #[tokio::test]
    async fn seek_past_end_is_rejected() {
        let (controller, _queue) = controller_with_pool().await;
        controller.play(-100, track("t1")).await.unwrap();
        let err = controller.seek(-100, 9_000).await.unwrap_err();
        assert!(matches!(err, EngineError::SeekBeyondDuration));
    }

    #[tokio::test]
    async fn seek_delta_below_minimum_is_rejected() {
        let (controller, _queue) = controller_with_pool().await;
        controller.play(-100, track("t1")).await.unwrap();
        let err = controller.seek(-100, 5).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn speed_outside_range_is_rejected() {
        let (controller, _queue) = controller_with_pool().await;
        controller.play(-100, track("t1")).await.unwrap();
        assert!(matches!(
            controller.set_speed(-100, 5.0).await.unwrap_err(),
            EngineError::InvalidArgument(_)
        ));
        assert!(matches!(
            controller.set_speed(-100, 0.1).await.unwrap_err(),
            EngineError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn stop_clears_state_and_returns_to_idle() {
        let (controller, queue) = controller_with_pool().await;
        controller.play(-100, track("t1")).await.unwrap();
        controller.stop(-100).await.unwrap();
        assert_eq!(controller.phase(-100).await, ChatPhase::Idle);
        assert!(!queue.is_active(-100));
        assert!(queue.get_current(-100).is_none());
    }

    #[tokio::test]
    async fn participant_leaving_drops_from_cache_and_removes_video() {
        let (controller, _queue) = controller_with_pool().await;
        controller.play(-100, track("t1")).await.unwrap();
        let session = controller.assistants.bind(-100).await.unwrap();

        controller
            .handle_participant_update(
                -100,
                &session,
                vec![ParticipantUpdate {
                    participant_id: 42,
                    left: false,
                    can_self_unmute: true,
                    video_endpoint: Some(("ep1".to_string(), vec![1])),
                    presentation_endpoint: None,
                }],
            )
            .await;

        controller
            .handle_participant_update(
                -100,
                &session,
                vec![ParticipantUpdate {
                    participant_id: 42,
                    left: true,
                    can_self_unmute: true,
                    video_endpoint: None,
                    presentation_endpoint: None,
                }],
            )
            .await;

        let cache = controller.call_participants.read().await;
        assert!(!cache.get(&-100).unwrap().contains_key(&42));
    }
}
