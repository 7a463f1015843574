//! The narrow command surface exposed to handler-layer code (§4.7).
//!
//! Thin normalization layer over [`crate::call::CallController`],
//! [`crate::queue::QueueStore`], [`crate::resolver::Resolver`], and
//! [`crate::downloader::Downloader`]. Everything a bot command needs goes
//! through here; the shape of the user-facing commands themselves is out
//! of the core's contract.

use crate::assistant::AssistantPool;
use crate::call::{CallController, ChatPhase};
use crate::downloader::Downloader;
use crate::error::{EngineError, Result};
use crate::queue::{QueueStore, QueuedTrack};
use crate::resolver::Resolver;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const LEAVE_ALL_PACING: Duration = Duration::from_millis(500);

pub struct CommandFacade {
    queue: Arc<QueueStore>,
    assistants: Arc<AssistantPool>,
    controller: Arc<CallController>,
    resolver: Arc<Resolver>,
    downloader: Arc<Downloader>,
    downloads_dir: String,
}

impl CommandFacade {
    #[must_use]
    pub fn new(
        queue: Arc<QueueStore>,
        assistants: Arc<AssistantPool>,
        controller: Arc<CallController>,
        resolver: Arc<Resolver>,
        downloader: Arc<Downloader>,
        downloads_dir: String,
    ) -> Self {
        Self {
            queue,
            assistants,
            controller,
            resolver,
            downloader,
            downloads_dir,
        }
    }

    /// Resolves `query`, downloads every returned track, enqueues them in
    /// order, and — if the chat was idle — joins the call and starts the
    /// first one. Returns the track that was enqueued (the first one, for a
    /// multi-track playlist resolution).
    #[instrument(skip(self), fields(chat_id, want_video))]
    pub async fn play(
        &self,
        chat_id: i64,
        query: &str,
        requester: &str,
        want_video: bool,
    ) -> Result<QueuedTrack> {
        let mut tracks = self.resolver.resolve(query, &self.downloads_dir).await?;
        if tracks.is_empty() {
            return Err(EngineError::NotFound(format!("no tracks resolved for {query}")));
        }

        let was_idle = self.controller.phase(chat_id).await == ChatPhase::Idle;
        let messaging = Arc::clone(&self.assistants.bind(chat_id).await?.messaging);

        let mut first: Option<QueuedTrack> = None;
        for mut info in tracks.drain(..) {
            let source = self.downloader.download(&messaging, &mut info).await?;
            let queued = QueuedTrack {
                info,
                source,
                loop_remaining: 0,
                enqueued_by: requester.to_string(),
                is_video: want_video,
            };
            self.queue.enqueue(chat_id, queued.clone());
            if first.is_none() {
                first = Some(queued);
            }
        }

        if was_idle {
            let head = self
                .queue
                .pop_next(chat_id)
                .expect("just enqueued at least one track");
            self.controller.play(chat_id, head.clone()).await?;
            return Ok(head);
        }

        Ok(first.expect("resolver returned at least one track"))
    }

    /// Advances the queue immediately (the `Skip` command), the same
    /// transition `OnStreamEnd` drives.
    pub async fn skip(&self, chat_id: i64) -> Result<()> {
        self.controller.play_next(chat_id).await
    }

    pub async fn stop(&self, chat_id: i64) -> Result<()> {
        self.controller.stop(chat_id).await
    }

    pub async fn pause(&self, chat_id: i64) -> Result<()> {
        self.controller.pause(chat_id).await
    }

    pub async fn resume(&self, chat_id: i64) -> Result<()> {
        self.controller.resume(chat_id).await
    }

    pub async fn mute(&self, chat_id: i64) -> Result<()> {
        self.controller.mute(chat_id).await
    }

    pub async fn unmute(&self, chat_id: i64) -> Result<()> {
        self.controller.unmute(chat_id).await
    }

    pub async fn seek(&self, chat_id: i64, delta_seconds: i64) -> Result<()> {
        self.controller.seek(chat_id, delta_seconds).await
    }

    pub async fn speed(&self, chat_id: i64, factor: f64) -> Result<()> {
        self.controller.set_speed(chat_id, factor).await
    }

    pub fn set_loop(&self, chat_id: i64, n: u32) -> Result<()> {
        self.queue.set_loop(chat_id, n)
    }

    pub fn remove(&self, chat_id: i64, index: usize) -> Result<QueuedTrack> {
        self.queue.remove_at(chat_id, index)
    }

    /// Snapshot of the current track plus the upcoming list, for the
    /// `Queue` command.
    #[must_use]
    pub fn queue_snapshot(&self, chat_id: i64) -> (Option<QueuedTrack>, Vec<QueuedTrack>) {
        (
            self.queue.get_current(chat_id),
            self.queue.upcoming_snapshot(chat_id),
        )
    }

    /// Elapsed playback time on the current stream, delegating to the RTC
    /// binding's `Time` on the default stream mode.
    pub async fn played_time(&self, chat_id: i64) -> Result<u64> {
        self.controller.played_time(chat_id).await
    }

    /// Iterates every assistant's dialogs, leaving every non-user,
    /// non-active chat with a 500 ms pacing between leaves. Returns the
    /// total count left across all assistants (§4.7 expansion, grounded in
    /// `original_source/src/vc/leave_all.go`).
    #[instrument(skip(self))]
    pub async fn leave_all(&self) -> usize {
        let active: std::collections::HashSet<i64> = self.queue.active_chats().into_iter().collect();
        let mut left = 0usize;

        for session in self.assistants.sessions() {
            let dialogs = match session.messaging.get_dialog_chat_ids().await {
                Ok(d) => d,
                Err(err) => {
                    warn!(assistant = %session.name, %err, "failed to fetch dialogs");
                    continue;
                }
            };

            for chat_id in dialogs {
                // Chat ids ≥ 0 are user (P2P) dialogs; only group/channel
                // dialogs (< 0) are ever left, and never an active one.
                if chat_id >= 0 || active.contains(&chat_id) {
                    continue;
                }

                match session.messaging.leave_chat(chat_id).await {
                    Ok(()) => left += 1,
                    Err(err) if is_already_absent(&err) => {
                        debug!(chat_id, %err, "already not a participant");
                    }
                    Err(err) => {
                        warn!(chat_id, %err, "failed to leave chat");
                    }
                }

                tokio::time::sleep(LEAVE_ALL_PACING).await;
            }
        }

        left
    }
}

/// Tolerates the messaging protocol's "already not a member" family of
/// errors, which `leave_all` treats as already-satisfied rather than a
/// failure.
fn is_already_absent(err: &EngineError) -> bool {
    let text = err.to_string();
    text.contains("USER_NOT_PARTICIPANT") || text.contains("CHANNEL_PRIVATE")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionType;
    use crate::db::DocumentStore;
    use crate::messaging::FakeMessagingClient;
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

    async fn facade_with_dialogs(dialogs: Vec<i64>) -> CommandFacade {
        let store = unconnected_store();
        let mut pool = AssistantPool::new(Arc::clone(&store));
        let fake = FakeMessagingClient::new(1);
        *fake.dialogs.lock().unwrap() = dialogs;
        let messaging: Arc<dyn crate::messaging::MessagingClient> = Arc::new(fake);
        let rtc = Arc::new(FakeRtcBinding::new());
        pool.start_assistant("deadbeef", SessionType::Gogram, messaging, rtc, false)
            .unwrap();
        let pool = Arc::new(pool);
        let queue = Arc::new(QueueStore::new());
        let controller = Arc::new(CallController::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            "/tmp/downloads".to_string(),
        ));
        let resolver = Arc::new(Resolver::new(
            None,
            None,
            Arc::clone(&store),
            Arc::new(FakeMessagingClient::new(1)),
            crate::config::DefaultService::Youtube,
        ));
        let downloader = Arc::new(Downloader::new("/tmp/downloads".to_string()));
        CommandFacade::new(queue, pool, controller, resolver, downloader, "/tmp/downloads".to_string())
    }

    #[tokio::test]
    async fn unresolvable_query_surfaces_as_an_error() {
        // No api-gateway endpoint is configured, so a bare search term can
        // never resolve; `play` should propagate the resolver's failure
        // rather than enqueue anything.
        let facade = facade_with_dialogs(Vec::new()).await;
        let err = facade.play(-100, "some random search", "alice", false).await;
        assert!(err.is_err());
        assert_eq!(facade.queue.queue_length(-100), 0);
    }

    #[tokio::test]
    async fn leave_all_skips_user_dialogs_and_active_chats() {
        // 10 is a user dialog (kept), -100 is an active group call (kept),
        // -200 is an inactive group/channel dialog (the only one left).
        let facade = facade_with_dialogs(vec![10, -100, -200]).await;
        facade.queue.set_active(-100, true);
        let left = facade.leave_all().await;
        assert_eq!(left, 1);
    }

    #[test]
    fn already_absent_errors_are_tolerated() {
        let err = EngineError::JoinFailed("USER_NOT_PARTICIPANT".to_string());
        assert!(is_already_absent(&err));
        let err = EngineError::JoinFailed("some other failure".to_string());
        assert!(!is_already_absent(&err));
    }
}
