//! Fan-in point for events the native RTC engine and the messaging
//! protocol push at the core, dispatched into [`crate::call::CallController`].
//!
//! Grounded in `original_source/src/vc/ubot/handle_updates.go` (protocol
//! update dispatch) and the `original_source/src/vc/ntgcalls/` directory
//! (the native engine's `OnStreamEnd`/`OnConnectionChange`/
//! `OnRequestBroadcastPart` callback registration). Both sources feed the
//! same controller; this module only routes, it holds no call-lifecycle
//! state of its own.

use crate::assistant::AssistantSession;
use crate::call::CallController;
use crate::messaging::RawUpdate;
use crate::rtc::ConnectionState;
use std::sync::Arc;
use tracing::{error, instrument, warn};

pub struct UpdateSink {
    controller: Arc<CallController>,
}

impl UpdateSink {
    #[must_use]
    pub fn new(controller: Arc<CallController>) -> Self {
        Self { controller }
    }

    /// A protocol update arrived on `session`'s connection.
    #[instrument(skip(self, update, session))]
    pub async fn on_raw_update(&self, update: RawUpdate, session: Arc<AssistantSession>) {
        if let Err(err) = self.controller.handle_raw_update(update, &session).await {
            warn!(assistant = %session.name, %err, "failed to handle protocol update");
        }
    }

    /// The native engine reported a connection-state transition for a call.
    pub async fn on_connection_change(&self, chat_id: i64, state: ConnectionState) {
        self.controller.on_connection_change(chat_id, state).await;
    }

    /// The native engine's audio/video source for `chat_id` reached end of
    /// stream; advances the queue the same way an explicit `Skip` would.
    #[instrument(skip(self))]
    pub async fn on_stream_end(&self, chat_id: i64) {
        if let Err(err) = self.controller.play_next(chat_id).await {
            error!(chat_id, %err, "failed to advance queue on stream end");
        }
    }

    /// The native engine is requesting the next broadcast part timestamp
    /// for a stream-mode group call.
    pub async fn on_request_broadcast_timestamp(
        &self,
        chat_id: i64,
        session: Arc<AssistantSession>,
    ) -> i64 {
        match self
            .controller
            .on_request_broadcast_timestamp(chat_id, &session)
            .await
        {
            Ok(ts) => ts,
            Err(err) => {
                warn!(chat_id, %err, "broadcast timestamp request failed");
                0
            }
        }
    }

    /// The native engine is requesting a specific broadcast part. Reports
    /// the outcome back to the engine itself via `RtcBinding::send_broadcast_part`,
    /// so this only needs to surface whether the request failed outright.
    #[allow(clippy::too_many_arguments)]
    pub async fn on_request_broadcast_part(
        &self,
        chat_id: i64,
        session: Arc<AssistantSession>,
        timestamp_ms: i64,
        channel_id: i32,
        quality: i32,
        limit: i32,
        part_id: i64,
        segment_id: i64,
        quality_update: bool,
    ) {
        if let Err(err) = self
            .controller
            .on_request_broadcast_part(
                chat_id,
                &session,
                timestamp_ms,
                channel_id,
                quality,
                limit,
                part_id,
                segment_id,
                quality_update,
            )
            .await
        {
            warn!(chat_id, %err, "broadcast part request failed");
        }
    }

    /// An invite link was discovered for `chat_id` (e.g. while resolving a
    /// private channel to join), cached for the next join attempt.
    pub async fn on_invite_link_discovered(&self, chat_id: i64, link: String) {
        self.controller.cache_invite_link(chat_id, link).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::AssistantPool;
    use crate::config::SessionType;
    use crate::db::DocumentStore;
    use crate::messaging::{FakeMessagingClient, InputPhoneCall};
    use crate::queue::QueueStore;
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

    async fn sink_with_session() -> (UpdateSink, Arc<AssistantSession>) {
        let store = unconnected_store();
        let mut pool = AssistantPool::new(Arc::clone(&store));
        let messaging = Arc::new(FakeMessagingClient::new(1));
        let rtc = Arc::new(FakeRtcBinding::new());
        pool.start_assistant("deadbeef", SessionType::Gogram, messaging, rtc, false)
            .unwrap();
        let pool = Arc::new(pool);
        let session = Arc::clone(&pool.sessions()[0]);
        let queue = Arc::new(QueueStore::new());
        let controller = Arc::new(CallController::new(queue, pool, "/tmp/downloads".to_string()));
        (UpdateSink::new(controller), session)
    }

    #[tokio::test]
    async fn stream_end_on_an_idle_chat_does_not_panic() {
        let (sink, _session) = sink_with_session().await;
        sink.on_stream_end(-42).await;
    }

    #[tokio::test]
    async fn phone_call_requested_is_routed_without_error() {
        let (sink, session) = sink_with_session().await;
        let update = RawUpdate::PhoneCallRequested {
            peer_user_id: 7,
            call: InputPhoneCall {
                id: 7,
                access_hash: 1,
            },
            g_a_hash: vec![1, 2, 3],
        };
        sink.on_raw_update(update, session).await;
    }

    #[tokio::test]
    async fn invite_link_discovery_is_cached_without_error() {
        let (sink, _session) = sink_with_session().await;
        sink.on_invite_link_discovered(-55, "https://t.me/+abc123".to_string())
            .await;
    }
}
