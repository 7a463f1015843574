//! The messaging-protocol client contract.
//!
//! Specified only by the interface the core consumes (§1's "external
//! collaborators"). A real implementation wraps a Telegram MTProto client
//! the way `original_source/src/vc/ubot` wraps `gogram`; tests and the rest
//! of this crate program against [`MessagingClient`] so the orchestration
//! engine never depends on a concrete wire protocol.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// A resolved peer: which kind of chat a chat id refers to, mirroring the
/// three `tg.Peer*` variants `leave_all.go`/`get_input_group_call.go`
/// switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    User(i64),
    Chat(i64),
    Channel(i64),
}

/// Opaque handle to a joined group call (`tg.InputGroupCall`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputGroupCall {
    pub id: i64,
    pub access_hash: i64,
}

/// Opaque handle to an in-progress P2P call (`tg.InputPhoneCall`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPhoneCall {
    pub id: i64,
    pub access_hash: i64,
}

/// Diffie-Hellman parameters for the P2P handshake (`messages.DhConfig`).
#[derive(Debug, Clone)]
pub struct DhConfig {
    pub g: i32,
    pub p: Vec<u8>,
    pub random: Vec<u8>,
}

/// An RTC connection endpoint handed back by the protocol after a call is
/// confirmed (`tg.PhoneConnection`).
#[derive(Debug, Clone)]
pub struct RtcServer {
    pub ip: String,
    pub port: u16,
    pub peer_tag: Vec<u8>,
    pub turn: bool,
}

/// The confirmed call object returned once both sides have exchanged keys.
#[derive(Debug, Clone)]
pub struct ConfirmedPhoneCall {
    pub connections: Vec<RtcServer>,
    pub library_versions: Vec<String>,
    pub p2p_allowed: bool,
}

/// One participant entry from a `tg.UpdateGroupCallParticipants` update.
#[derive(Debug, Clone)]
pub struct ParticipantUpdate {
    pub participant_id: i64,
    pub left: bool,
    pub can_self_unmute: bool,
    /// `(endpoint, source groups)` if the participant has an active camera.
    pub video_endpoint: Option<(String, Vec<u32>)>,
    /// `(endpoint, source groups)` if the participant is presenting/screen-sharing.
    pub presentation_endpoint: Option<(String, Vec<u32>)>,
}

/// A raw protocol update relevant to voice-call orchestration, dispatched by
/// the Update Sink into [`crate::call::CallController`].
#[derive(Debug, Clone)]
pub enum RawUpdate {
    PhoneCallRequested {
        peer_user_id: i64,
        call: InputPhoneCall,
        g_a_hash: Vec<u8>,
    },
    PhoneCallAccepted {
        peer_user_id: i64,
        call: InputPhoneCall,
        g_b: Vec<u8>,
    },
    PhoneCallConfirmed {
        peer_user_id: i64,
        g_a_or_b: Vec<u8>,
        key_fingerprint: i64,
        call: ConfirmedPhoneCall,
    },
    PhoneCallDiscarded {
        peer_user_id: i64,
        busy: bool,
    },
    PhoneCallSignalingData {
        peer_user_id: i64,
        data: Vec<u8>,
    },
    GroupCallParticipants {
        chat_id: i64,
        participants: Vec<ParticipantUpdate>,
    },
    GroupCallUpdated {
        chat_id: i64,
        call: Option<InputGroupCall>,
    },
}

/// Bytes returned from a broadcast-part fetch, or the negotiated outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastFetch {
    Success(Vec<u8>),
    NotReady,
    ResyncNeeded,
}

/// The messaging-protocol operations the core depends on. All are
/// suspension points per §5 and must never be called while holding one of
/// `CallController`'s internal locks.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// This client's own user id (`self.ID` in the original).
    fn self_id(&self) -> i64;

    async fn resolve_peer(&self, chat_id: i64) -> Result<PeerKind>;

    /// Fetch (or create) the `InputGroupCall` handle for a chat, the way
    /// `getInputGroupCall` does via `ChannelsGetFullChannel`/`MessagesGetFullChat`.
    async fn get_input_group_call(&self, chat_id: i64) -> Result<InputGroupCall>;

    async fn phone_join_group_call(
        &self,
        call: &InputGroupCall,
        params_json: &str,
        muted: bool,
        video_stopped: bool,
    ) -> Result<String>;

    async fn phone_leave_group_call(&self, call: &InputGroupCall) -> Result<()>;

    async fn phone_get_group_call_stream_channels(
        &self,
        call: &InputGroupCall,
    ) -> Result<Vec<i64>>;

    async fn upload_group_call_stream(
        &self,
        call: &InputGroupCall,
        timestamp_ms: i64,
        channel_id: i32,
        quality: i32,
        limit: i32,
    ) -> Result<BroadcastFetch>;

    async fn get_dh_config(&self) -> Result<DhConfig>;

    async fn get_sendable_user(&self, chat_id: i64) -> Result<i64>;

    async fn phone_request_call(&self, user_id: i64, g_a_hash: &[u8], video: bool) -> Result<()>;

    async fn phone_accept_call(
        &self,
        call: &InputPhoneCall,
        g_b: &[u8],
    ) -> Result<()>;

    async fn phone_confirm_call(
        &self,
        call: &InputPhoneCall,
        g_a: &[u8],
        key_fingerprint: i64,
    ) -> Result<ConfirmedPhoneCall>;

    async fn send_signaling_data(&self, call: &InputPhoneCall, data: &[u8]) -> Result<()>;

    /// Download a message's attached media by its deep-link path
    /// (`host/username/messageId`) into `downloads_dir`, returning the final
    /// file path.
    async fn download_deep_link(&self, deep_link: &str, downloads_dir: &str) -> Result<String>;

    /// Download media referenced by a file id into `downloads_dir/name`,
    /// reusing the file verbatim if it already exists.
    async fn download_file_id(&self, file_id: &str, name: &str, downloads_dir: &str)
        -> Result<String>;

    /// All dialog chat ids this assistant currently has, used by `LeaveAll`.
    async fn get_dialog_chat_ids(&self) -> Result<Vec<i64>>;

    async fn leave_chat(&self, chat_id: i64) -> Result<()>;

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;

    /// Disconnects this client, mirroring `client.Stop()` in
    /// `original_source/src/vc/calls.go`'s `StopAllClients`.
    async fn disconnect(&self) -> Result<()>;
}

/// An in-memory [`MessagingClient`] used by tests and by the `CallController`
/// unit tests that don't need a live Telegram connection.
#[derive(Default)]
pub struct FakeMessagingClient {
    pub self_id: i64,
    pub dialogs: Mutex<Vec<i64>>,
    pub left: Mutex<Vec<i64>>,
    pub sent: Mutex<Vec<(i64, String)>>,
    pub group_calls: Mutex<HashMap<i64, InputGroupCall>>,
}

impl FakeMessagingClient {
    #[must_use]
    pub fn new(self_id: i64) -> Self {
        Self {
            self_id,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MessagingClient for FakeMessagingClient {
    fn self_id(&self) -> i64 {
        self.self_id
    }

    async fn resolve_peer(&self, chat_id: i64) -> Result<PeerKind> {
        Ok(if chat_id < 0 {
            PeerKind::Channel(chat_id)
        } else {
            PeerKind::User(chat_id)
        })
    }

    async fn get_input_group_call(&self, chat_id: i64) -> Result<InputGroupCall> {
        let mut calls = self.group_calls.lock().unwrap();
        Ok(calls
            .entry(chat_id)
            .or_insert_with(|| InputGroupCall {
                id: chat_id,
                access_hash: 1,
            })
            .clone())
    }

    async fn phone_join_group_call(
        &self,
        _call: &InputGroupCall,
        _params_json: &str,
        _muted: bool,
        _video_stopped: bool,
    ) -> Result<String> {
        Ok("{\"transport\": null}".to_string())
    }

    async fn phone_leave_group_call(&self, _call: &InputGroupCall) -> Result<()> {
        Ok(())
    }

    async fn phone_get_group_call_stream_channels(
        &self,
        _call: &InputGroupCall,
    ) -> Result<Vec<i64>> {
        Ok(vec![0])
    }

    async fn upload_group_call_stream(
        &self,
        _call: &InputGroupCall,
        _timestamp_ms: i64,
        _channel_id: i32,
        _quality: i32,
        _limit: i32,
    ) -> Result<BroadcastFetch> {
        Ok(BroadcastFetch::NotReady)
    }

    async fn get_dh_config(&self) -> Result<DhConfig> {
        Ok(DhConfig {
            g: 3,
            p: vec![0xff; 256],
            random: vec![1; 256],
        })
    }

    async fn get_sendable_user(&self, chat_id: i64) -> Result<i64> {
        Ok(chat_id)
    }

    async fn phone_request_call(&self, _user_id: i64, _g_a_hash: &[u8], _video: bool) -> Result<()> {
        Ok(())
    }

    async fn phone_accept_call(&self, _call: &InputPhoneCall, _g_b: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn phone_confirm_call(
        &self,
        _call: &InputPhoneCall,
        _g_a: &[u8],
        _key_fingerprint: i64,
    ) -> Result<ConfirmedPhoneCall> {
        Ok(ConfirmedPhoneCall {
            connections: Vec::new(),
            library_versions: Vec::new(),
            p2p_allowed: true,
        })
    }

    async fn send_signaling_data(&self, _call: &InputPhoneCall, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn download_deep_link(&self, deep_link: &str, downloads_dir: &str) -> Result<String> {
        Ok(format!("{downloads_dir}/{}", deep_link.replace('/', "_")))
    }

    async fn download_file_id(
        &self,
        _file_id: &str,
        name: &str,
        downloads_dir: &str,
    ) -> Result<String> {
        Ok(format!("{downloads_dir}/{name}"))
    }

    async fn get_dialog_chat_ids(&self) -> Result<Vec<i64>> {
        Ok(self.dialogs.lock().unwrap().clone())
    }

    async fn leave_chat(&self, chat_id: i64) -> Result<()> {
        self.left.lock().unwrap().push(chat_id);
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Decodes a `FloodWait` out of any error text a [`MessagingClient`] call
/// might return, the way `telegram.GetFloodWait` inspects the RPC error
/// string. Callers retry exactly once per call-site per §5.
#[must_use]
pub fn flood_wait_seconds(err: &EngineError) -> Option<u64> {
    match err {
        EngineError::FloodWait(d) => Some(d.as_secs()),
        _ => None,
    }
}
