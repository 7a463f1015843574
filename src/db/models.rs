//! Playlist data model (expansion, grounded in
//! `original_source/src/core/db/playlist.go`).

use serde::{Deserialize, Serialize};

/// A single song saved inside a [`Playlist`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Song {
    pub url: String,
    pub name: String,
    pub track_id: String,
    pub duration_seconds: u64,
    pub platform: String,
}

/// A user's named, ordered collection of saved songs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub owner: i64,
    pub songs: Vec<Song>,
}
