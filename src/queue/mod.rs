//! Per-chat queue and playback state.
//!
//! Thread-safe mutation API over an in-memory map, one coarse lock per chat
//! (`dashmap` shards internally, matching the "coarse per-chat locks" rule
//! from the concurrency model).

use crate::error::{EngineError, Result};
use dashmap::DashMap;
use std::collections::VecDeque;

pub const MAX_LOOP: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    Youtube,
    Spotify,
    TelegramMedia,
    DirectLink,
}

/// Normalized resolver output for a single track.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub duration_seconds: u64,
    pub platform: Platform,
    pub cover_url: Option<String>,
    pub canonical_url: String,
    pub cdn_url: Option<String>,
}

/// A track bound to a chat's queue: the resolver output plus where the
/// actual bytes live and who asked for it.
#[derive(Debug, Clone)]
pub struct QueuedTrack {
    pub info: TrackInfo,
    /// Resolved local file path or a pass-through URL.
    pub source: String,
    pub loop_remaining: u32,
    pub enqueued_by: String,
    pub is_video: bool,
}

#[derive(Debug, Default)]
struct ChatState {
    active: bool,
    current: Option<QueuedTrack>,
    upcoming: VecDeque<QueuedTrack>,
    loop_count: u32,
    muted_by_admin: bool,
}

/// Per-chat queue, active flag, current track, and loop count.
#[derive(Default)]
pub struct QueueStore {
    chats: DashMap<i64, ChatState>,
}

impl QueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, chat_id: i64, track: QueuedTrack) {
        self.chats
            .entry(chat_id)
            .or_default()
            .upcoming
            .push_back(track);
    }

    pub fn contains(&self, chat_id: i64, track_id: &str) -> bool {
        self.chats.get(&chat_id).is_some_and(|state| {
            state
                .current
                .as_ref()
                .is_some_and(|t| t.info.id == track_id)
                || state.upcoming.iter().any(|t| t.info.id == track_id)
        })
    }

    pub fn pop_next(&self, chat_id: i64) -> Option<QueuedTrack> {
        self.chats.get_mut(&chat_id)?.upcoming.pop_front()
    }

    pub fn set_active(&self, chat_id: i64, active: bool) {
        self.chats.entry(chat_id).or_default().active = active;
    }

    pub fn is_active(&self, chat_id: i64) -> bool {
        self.chats.get(&chat_id).is_some_and(|s| s.active)
    }

    pub fn set_current(&self, chat_id: i64, track: QueuedTrack) {
        self.chats.entry(chat_id).or_default().current = Some(track);
    }

    pub fn clear_current(&self, chat_id: i64) {
        if let Some(mut state) = self.chats.get_mut(&chat_id) {
            state.current = None;
        }
    }

    pub fn get_current(&self, chat_id: i64) -> Option<QueuedTrack> {
        self.chats.get(&chat_id)?.current.clone()
    }

    pub fn set_loop(&self, chat_id: i64, n: u32) -> Result<()> {
        if n > MAX_LOOP {
            return Err(EngineError::InvalidArgument(format!(
                "loop count {n} exceeds max {MAX_LOOP}"
            )));
        }
        self.chats.entry(chat_id).or_default().loop_count = n;
        Ok(())
    }

    pub fn get_loop(&self, chat_id: i64) -> u32 {
        self.chats.get(&chat_id).map_or(0, |s| s.loop_count)
    }

    /// 1-based index into `upcoming`.
    pub fn remove_at(&self, chat_id: i64, index: usize) -> Result<QueuedTrack> {
        let mut state = self.chats.get_mut(&chat_id).ok_or(EngineError::OutOfRange)?;
        if index == 0 || index > state.upcoming.len() {
            return Err(EngineError::OutOfRange);
        }
        state
            .upcoming
            .remove(index - 1)
            .ok_or(EngineError::OutOfRange)
    }

    pub fn clear_chat(&self, chat_id: i64) {
        self.chats.remove(&chat_id);
    }

    pub fn active_chats(&self) -> Vec<i64> {
        self.chats
            .iter()
            .filter(|e| e.value().active)
            .map(|e| *e.key())
            .collect()
    }

    pub fn queue_length(&self, chat_id: i64) -> usize {
        self.chats.get(&chat_id).map_or(0, |s| s.upcoming.len())
    }

    /// Snapshot of `upcoming`, in FIFO order, for the `Queue` command.
    pub fn upcoming_snapshot(&self, chat_id: i64) -> Vec<QueuedTrack> {
        self.chats
            .get(&chat_id)
            .map_or_else(Vec::new, |s| s.upcoming.iter().cloned().collect())
    }

    pub fn set_muted_by_admin(&self, chat_id: i64, muted: bool) {
        self.chats.entry(chat_id).or_default().muted_by_admin = muted;
    }

    pub fn muted_by_admin(&self, chat_id: i64) -> bool {
        self.chats.get(&chat_id).is_some_and(|s| s.muted_by_admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> QueuedTrack {
        QueuedTrack {
            info: TrackInfo {
                id: id.to_string(),
                title: id.to_string(),
                duration_seconds: 100,
                platform: Platform::Youtube,
                cover_url: None,
                canonical_url: format!("https://example.com/{id}"),
                cdn_url: None,
            },
            source: format!("/tmp/{id}"),
            loop_remaining: 0,
            enqueued_by: "alice".to_string(),
            is_video: false,
        }
    }

    #[test]
    fn fifo_order_minus_removals() {
        let store = QueueStore::new();
        store.enqueue(1, track("a"));
        store.enqueue(1, track("b"));
        store.enqueue(1, track("c"));
        assert_eq!(store.queue_length(1), 3);

        store.remove_at(1, 2).unwrap(); // removes "b"
        assert_eq!(store.queue_length(1), 2);

        assert_eq!(store.pop_next(1).unwrap().info.id, "a");
        assert_eq!(store.pop_next(1).unwrap().info.id, "c");
        assert!(store.pop_next(1).is_none());
    }

    #[test]
    fn remove_at_out_of_range() {
        let store = QueueStore::new();
        store.enqueue(1, track("a"));
        assert!(matches!(
            store.remove_at(1, 2),
            Err(EngineError::OutOfRange)
        ));
        assert!(matches!(
            store.remove_at(1, 0),
            Err(EngineError::OutOfRange)
        ));
    }

    #[test]
    fn loop_count_validated() {
        let store = QueueStore::new();
        assert!(store.set_loop(1, MAX_LOOP).is_ok());
        assert!(matches!(
            store.set_loop(1, MAX_LOOP + 1),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn clear_chat_drops_everything() {
        let store = QueueStore::new();
        store.set_active(1, true);
        store.enqueue(1, track("a"));
        store.set_current(1, track("b"));
        store.set_loop(1, 3).unwrap();

        store.clear_chat(1);

        assert!(!store.is_active(1));
        assert_eq!(store.queue_length(1), 0);
        assert!(store.get_current(1).is_none());
        assert_eq!(store.get_loop(1), 0);
    }

    #[test]
    fn active_chats_lists_only_active() {
        let store = QueueStore::new();
        store.set_active(1, true);
        store.set_active(2, false);
        store.set_active(3, true);
        let mut active = store.active_chats();
        active.sort_unstable();
        assert_eq!(active, vec![1, 3]);
    }

    #[test]
    fn contains_checks_current_and_upcoming() {
        let store = QueueStore::new();
        store.set_current(1, track("a"));
        store.enqueue(1, track("b"));
        assert!(store.contains(1, "a"));
        assert!(store.contains(1, "b"));
        assert!(!store.contains(1, "c"));
    }
}
