//! The assistant session pool.
//!
//! Grounded in `original_source/src/vc/calls.go` (`getClientName`,
//! `StartClient`, `StopAllClients`) and `original_source/src/vc/ubot/context.go`
//! for the shape of a started client. Chats are bound to an assistant by a
//! sticky assignment persisted in the document store, falling back to a
//! uniform-random pick when no binding exists yet.

use crate::config::SessionType;
use crate::db::DocumentStore;
use crate::error::{EngineError, Result};
use crate::messaging::MessagingClient;
use crate::rtc::RtcBinding;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// One started assistant: its logical name plus the two handles the rest of
/// the engine drives it through.
pub struct AssistantSession {
    pub name: String,
    pub messaging: Arc<dyn MessagingClient>,
    pub rtc: Arc<dyn RtcBinding>,
    pub self_id: i64,
}

/// Registry of started assistant sessions with sticky chat→assistant
/// binding, backed by a [`DocumentStore`].
pub struct AssistantPool {
    sessions: Vec<Arc<AssistantSession>>,
    store: Arc<DocumentStore>,
}

impl AssistantPool {
    #[must_use]
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            sessions: Vec::new(),
            store,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Every started assistant session, in pool order. Used by `LeaveAll`
    /// to fan out across the whole pool.
    #[must_use]
    pub fn sessions(&self) -> &[Arc<AssistantSession>] {
        &self.sessions
    }

    /// Decodes `session_string` for `session_type`, starts a messaging
    /// client and an RTC binding for it, and appends the result to the
    /// pool. The decoded session name is derived from the client's own
    /// user id once authenticated, matching `getClientName`.
    ///
    /// Callers supply the already-constructed messaging client and RTC
    /// binding for the decoded session (constructing either is outside
    /// this crate's scope: they are foreign modules per the native-binding
    /// and messaging-protocol design notes). This method validates the
    /// session string's format and the resulting account's kind before
    /// admitting it to the pool.
    #[instrument(skip(self, session_string, messaging, rtc), fields(session_type = ?session_type))]
    pub fn start_assistant(
        &mut self,
        session_string: &str,
        session_type: SessionType,
        messaging: Arc<dyn MessagingClient>,
        rtc: Arc<dyn RtcBinding>,
        is_bot: bool,
    ) -> Result<()> {
        decode_session(session_string, session_type)?;

        if is_bot {
            return Err(EngineError::NotUserAccount);
        }

        let self_id = messaging.self_id();
        let name = format!("assistant{}", self.sessions.len() + 1);
        info!(assistant = %name, self_id, "assistant started");

        self.sessions.push(Arc::new(AssistantSession {
            name,
            messaging,
            rtc,
            self_id,
        }));
        Ok(())
    }

    /// Resolves the assistant bound to `chat_id`, persisting a fresh
    /// uniform-random choice if none is bound yet.
    ///
    /// TODO: selection is uniform-random with no load awareness; a future
    /// revision could apply consistent hashing or least-loaded selection.
    #[instrument(skip(self), fields(chat_id))]
    pub async fn bind(&self, chat_id: i64) -> Result<Arc<AssistantSession>> {
        if self.sessions.is_empty() {
            return Err(EngineError::Fatal("assistant pool is empty".to_string()));
        }

        if let Some(name) = self.store.get_assistant(chat_id).await {
            if let Some(session) = self.sessions.iter().find(|s| s.name == name) {
                return Ok(Arc::clone(session));
            }
        }

        let chosen = self
            .sessions
            .choose(&mut rand::thread_rng())
            .expect("checked non-empty above");

        if let Err(err) = self.store.set_assistant(chat_id, &chosen.name).await {
            warn!(chat_id, error = %err, "failed to persist assistant binding");
        }

        Ok(Arc::clone(chosen))
    }

    /// Stops every assistant: RTC binding first, then messaging client,
    /// best-effort per assistant.
    #[instrument(skip(self))]
    pub async fn stop_all(&mut self) {
        for session in &self.sessions {
            session.rtc.free();
            if let Err(err) = session.messaging.disconnect().await {
                warn!(assistant = %session.name, error = %err, "error stopping assistant");
            }
        }
        self.sessions.clear();
    }

    /// Drops every persisted chat→assistant binding.
    pub async fn clear_all_bindings(&self) -> Result<()> {
        self.store.clear_all_bindings().await
    }
}

/// Validates `session_string` against the expected shape for
/// `session_type`, failing with `SessionFormat` if it is obviously
/// malformed. Actual client construction happens in the caller; this only
/// gates entry into the pool the way `StartClient` validates before
/// connecting.
fn decode_session(session_string: &str, session_type: SessionType) -> Result<()> {
    if session_string.trim().is_empty() {
        return Err(EngineError::SessionFormat("empty session string".to_string()));
    }
    match session_type {
        SessionType::Pyrogram | SessionType::Telethon => {
            // Both are base64-ish opaque blobs; reject whitespace, which
            // neither encoding ever produces.
            if session_string.chars().any(char::is_whitespace) {
                return Err(EngineError::SessionFormat(
                    "pyrogram/telethon session strings cannot contain whitespace".to_string(),
                ));
            }
        }
        SessionType::Gogram => {
            // gogram session strings are hex-encoded; assert that shape.
            if !session_string.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(EngineError::SessionFormat(
                    "gogram session strings must be hex-encoded".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::FakeMessagingClient;
    use crate::rtc::FakeRtcBinding;
    use fred::prelude::{RedisClient, RedisConfig};

    /// An unconnected client is fine for tests that never issue a Redis
    /// command (pool construction, `start_assistant`'s validation path).
    fn unconnected_store() -> Arc<DocumentStore> {
        Arc::new(DocumentStore::new(RedisClient::new(
            RedisConfig::default(),
            None,
            None,
            None,
        )))
    }

    #[test]
    fn rejects_empty_session_string() {
        let err = decode_session("", SessionType::Pyrogram).unwrap_err();
        assert!(matches!(err, EngineError::SessionFormat(_)));
    }

    #[test]
    fn rejects_whitespace_in_pyrogram_session() {
        let err = decode_session("abc def", SessionType::Pyrogram).unwrap_err();
        assert!(matches!(err, EngineError::SessionFormat(_)));
    }

    #[test]
    fn accepts_hex_gogram_session() {
        assert!(decode_session("deadbeef", SessionType::Gogram).is_ok());
    }

    #[test]
    fn rejects_non_hex_gogram_session() {
        let err = decode_session("not-hex!", SessionType::Gogram).unwrap_err();
        assert!(matches!(err, EngineError::SessionFormat(_)));
    }

    #[test]
    fn bot_account_is_rejected_before_joining_pool() {
        let mut pool = AssistantPool::new(unconnected_store());
        let messaging = Arc::new(FakeMessagingClient::new(1));
        let rtc = Arc::new(FakeRtcBinding::new());
        let err = pool
            .start_assistant("deadbeef", SessionType::Gogram, messaging, rtc, true)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotUserAccount));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn valid_session_is_admitted_to_the_pool() {
        let mut pool = AssistantPool::new(unconnected_store());
        let messaging = Arc::new(FakeMessagingClient::new(7));
        let rtc = Arc::new(FakeRtcBinding::new());
        pool.start_assistant("deadbeef", SessionType::Gogram, messaging, rtc, false)
            .unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn bind_fails_fatal_on_empty_pool() {
        let pool = AssistantPool::new(unconnected_store());
        let err = pool.bind(123).await.unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));
    }
}
