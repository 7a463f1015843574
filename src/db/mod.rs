//! External document store.
//!
//! Key/value per chat and per user, plus playlist CRUD, all backed by a
//! single `fred` Redis client — the teacher's Redis usage generalized from
//! an event stream into a document store, matching what
//! `original_source/src/core/db/playlist.go` actually persists.

mod models;

pub use models::{Playlist, Song};

use crate::error::{EngineError, Result};
use fred::prelude::*;
use rand::RngCore;
use std::time::Duration;

const ASSISTANT_BINDING_PREFIX: &str = "assistant_binding:";
const PLAYLIST_PREFIX: &str = "playlist:";
/// Prefix identifying a query string as a playlist id rather than a URL or
/// search term, consumed by the resolver's playlist-marker branch.
pub const PLAYLIST_ID_PREFIX: &str = "tgpl_";
const USER_PLAYLISTS_PREFIX: &str = "user_playlists:";
const LANG_PREFIX: &str = "lang:";
const LOGGER_STATUS_PREFIX: &str = "logger_status:";

/// Default per-call timeout applied at document-store call-sites, matching
/// the teacher's single-short-deadline-per-round-trip convention
/// (`db.Ctx()` in the original Go).
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin wrapper over a `fred::RedisClient`, the document store the core
/// depends on for sticky assistant bindings, playlists, and per-chat
/// preferences.
pub struct DocumentStore {
    redis: RedisClient,
}

impl DocumentStore {
    #[must_use]
    pub const fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    /// Connects to the document store at `uri` and waits for the connection
    /// to come up.
    pub async fn connect(uri: &str) -> Result<Self> {
        let config =
            RedisConfig::from_url(uri).map_err(|e| EngineError::ResolveFailed(e.into()))?;
        let client = RedisClient::new(config, None, None, None);
        client.connect();
        client
            .wait_for_connect()
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))?;
        Ok(Self::new(client))
    }

    // -- sticky assistant bindings -----------------------------------------

    pub async fn get_assistant(&self, chat_id: i64) -> Option<String> {
        let key = format!("{ASSISTANT_BINDING_PREFIX}{chat_id}");
        self.redis
            .get::<Option<String>, _>(key)
            .await
            .ok()
            .flatten()
    }

    pub async fn set_assistant(&self, chat_id: i64, name: &str) -> Result<()> {
        let key = format!("{ASSISTANT_BINDING_PREFIX}{chat_id}");
        self.redis
            .set::<(), _, _>(key, name, None, None, false)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))
    }

    /// Drops every persisted chat→assistant binding. Safe while calls are
    /// active; re-binding happens lazily on the next `Play`.
    pub async fn clear_all_bindings(&self) -> Result<()> {
        let pattern = format!("{ASSISTANT_BINDING_PREFIX}*");
        let keys: Vec<String> = self
            .redis
            .keys(pattern)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))?;
        if keys.is_empty() {
            return Ok(());
        }
        self.redis
            .del::<(), _>(keys)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))
    }

    // -- per-chat preferences -----------------------------------------------

    pub async fn get_lang(&self, chat_id: i64) -> String {
        let key = format!("{LANG_PREFIX}{chat_id}");
        self.redis
            .get::<Option<String>, _>(key)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "en".to_string())
    }

    pub async fn set_lang(&self, chat_id: i64, lang: &str) -> Result<()> {
        let key = format!("{LANG_PREFIX}{chat_id}");
        self.redis
            .set::<(), _, _>(key, lang, None, None, false)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))
    }

    pub async fn get_logger_status(&self, owner_id: i64) -> bool {
        let key = format!("{LOGGER_STATUS_PREFIX}{owner_id}");
        self.redis
            .get::<Option<String>, _>(key)
            .await
            .ok()
            .flatten()
            .is_some_and(|v| v == "1")
    }

    pub async fn set_logger_status(&self, owner_id: i64, enabled: bool) -> Result<()> {
        let key = format!("{LOGGER_STATUS_PREFIX}{owner_id}");
        self.redis
            .set::<(), _, _>(key, if enabled { "1" } else { "0" }, None, None, false)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))
    }

    // -- playlists (expansion, grounded in original_source/src/core/db/playlist.go) --

    pub async fn create_playlist(&self, owner: i64, name: &str) -> Result<Playlist> {
        let id = generate_playlist_id();
        let playlist = Playlist {
            id: id.clone(),
            name: name.to_string(),
            owner,
            songs: Vec::new(),
        };
        self.put_playlist(&playlist).await?;

        let user_key = format!("{USER_PLAYLISTS_PREFIX}{owner}");
        self.redis
            .sadd::<(), _, _>(user_key, id)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))?;
        Ok(playlist)
    }

    pub async fn get_playlist(&self, id: &str) -> Result<Option<Playlist>> {
        let key = format!("{PLAYLIST_PREFIX}{id}");
        let raw: Option<String> = self
            .redis
            .get(key)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| EngineError::ResolveFailed(e.into()))
        })
        .transpose()
    }

    pub async fn delete_playlist(&self, id: &str, owner: i64) -> Result<()> {
        let Some(playlist) = self.get_playlist(id).await? else {
            return Ok(());
        };
        if playlist.owner != owner {
            return Err(EngineError::NotFound(format!("playlist {id}")));
        }
        let key = format!("{PLAYLIST_PREFIX}{id}");
        self.redis
            .del::<(), _>(key)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))?;
        let user_key = format!("{USER_PLAYLISTS_PREFIX}{owner}");
        self.redis
            .srem::<(), _, _>(user_key, id)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))
    }

    /// No-op if a song with the same track id already exists.
    pub async fn add_song_to_playlist(&self, id: &str, song: Song) -> Result<()> {
        let Some(mut playlist) = self.get_playlist(id).await? else {
            return Err(EngineError::NotFound(format!("playlist {id}")));
        };
        if playlist.songs.iter().any(|s| s.track_id == song.track_id) {
            return Ok(());
        }
        playlist.songs.push(song);
        self.put_playlist(&playlist).await
    }

    pub async fn remove_song_from_playlist(&self, id: &str, track_id: &str) -> Result<()> {
        let Some(mut playlist) = self.get_playlist(id).await? else {
            return Err(EngineError::NotFound(format!("playlist {id}")));
        };
        let before = playlist.songs.len();
        playlist.songs.retain(|s| s.track_id != track_id);
        if playlist.songs.len() == before {
            return Err(EngineError::NotFound(format!(
                "track {track_id} not found in playlist {id}"
            )));
        }
        self.put_playlist(&playlist).await
    }

    pub async fn list_user_playlists(&self, owner: i64) -> Result<Vec<Playlist>> {
        let user_key = format!("{USER_PLAYLISTS_PREFIX}{owner}");
        let ids: Vec<String> = self
            .redis
            .smembers(user_key)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = self.get_playlist(&id).await? {
                out.push(p);
            }
        }
        Ok(out)
    }

    async fn put_playlist(&self, playlist: &Playlist) -> Result<()> {
        let key = format!("{PLAYLIST_PREFIX}{}", playlist.id);
        let json =
            serde_json::to_string(playlist).map_err(|e| EngineError::ResolveFailed(e.into()))?;
        self.redis
            .set::<(), _, _>(key, json, None, None, false)
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))
    }
}

/// `tgpl_` followed by 5 random hex bytes, matching
/// `generateUniquePlaylistID` in `original_source/src/core/db/playlist.go`.
fn generate_playlist_id() -> String {
    let mut bytes = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("tgpl_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_ids_are_prefixed_and_distinct() {
        let a = generate_playlist_id();
        let b = generate_playlist_id();
        assert!(a.starts_with("tgpl_"));
        assert_eq!(a.len(), "tgpl_".len() + 10);
        assert_ne!(a, b);
    }
}
