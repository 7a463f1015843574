//! Materializes a playable artifact from a resolved [`TrackInfo`].
//!
//! Grounded in `original_source/src/vc/ubot/play.go`'s download dispatch and
//! the per-platform download paths in `original_source/src/core/dl/api.go`
//! and `original_source/src/core/dl/direct_link.go`, plus
//! `original_source/src/core/cache/extras.go`'s duration backfill. Single-
//! flight discipline for concurrent downloads of the same track id is left
//! to the caller (`QueueStore::contains`), per §4.4.

use crate::error::{EngineError, Result};
use crate::messaging::MessagingClient;
use crate::queue::{Platform, TrackInfo};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::instrument;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(180);
const DURATION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    format: FormatSection,
}

#[derive(Debug, Default, Deserialize)]
struct FormatSection {
    duration: Option<String>,
}

/// Acquires bytes (or a pass-through URL) for a resolved track, per §4.4.
pub struct Downloader {
    downloads_dir: String,
}

impl Downloader {
    #[must_use]
    pub const fn new(downloads_dir: String) -> Self {
        Self { downloads_dir }
    }

    /// Returns a local file path or a pass-through URL the transcoder can
    /// open directly. Mutates `track.duration_seconds` via the ffprobe
    /// backfill if the resolver left it at zero.
    #[instrument(skip(self, messaging, track), fields(track_id = %track.id))]
    pub async fn download(
        &self,
        messaging: &Arc<dyn MessagingClient>,
        track: &mut TrackInfo,
    ) -> Result<String> {
        let source = timeout(DOWNLOAD_TIMEOUT, self.download_inner(messaging, track))
            .await
            .map_err(|_| EngineError::DownloadFailed(anyhow::anyhow!("download timed out")))??;

        if track.duration_seconds == 0 {
            if let Some(seconds) = probe_duration(&source).await {
                track.duration_seconds = seconds;
            }
        }

        Ok(source)
    }

    async fn download_inner(
        &self,
        messaging: &Arc<dyn MessagingClient>,
        track: &TrackInfo,
    ) -> Result<String> {
        match track.platform {
            Platform::TelegramMedia => {
                let name = sanitize_name(&track.id);
                let path = format!("{}/{name}", self.downloads_dir);
                if Path::new(&path).is_file() {
                    return Ok(path);
                }
                messaging
                    .download_file_id(&track.id, &name, &self.downloads_dir)
                    .await
            }
            Platform::DirectLink => Ok(track.canonical_url.clone()),
            Platform::Youtube | Platform::Spotify => {
                let source = track
                    .cdn_url
                    .clone()
                    .unwrap_or_else(|| track.canonical_url.clone());
                if is_messaging_deep_link(&source) {
                    // The adapter delegated hosting to the messaging service;
                    // recursively download the referenced media.
                    messaging
                        .download_deep_link(&source, &self.downloads_dir)
                        .await
                } else {
                    Ok(source)
                }
            }
        }
    }
}

fn sanitize_name(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

fn is_messaging_deep_link(url: &str) -> bool {
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    stripped.starts_with("t.me/")
}

/// `ffprobe -show_format`, 5 s deadline. A probe failure leaves the
/// duration untouched rather than failing the download, per §4.4.
async fn probe_duration(path: &str) -> Option<u64> {
    let run = async {
        let output = Command::new("ffprobe")
            .args(["-v", "quiet", "-print_format", "json", "-show_format", path])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let parsed: FfprobeFormat = serde_json::from_slice(&output.stdout).ok()?;
        parsed.format.duration.as_deref()?.parse::<f64>().ok().map(|d| d as u64)
    };

    timeout(DURATION_PROBE_TIMEOUT, run).await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::FakeMessagingClient;

    fn track(platform: Platform) -> TrackInfo {
        TrackInfo {
            id: "abc".to_string(),
            title: "Title".to_string(),
            duration_seconds: 0,
            platform,
            cover_url: None,
            canonical_url: "https://example.com/abc".to_string(),
            cdn_url: Some("https://cdn.example.com/abc.mp3".to_string()),
        }
    }

    #[tokio::test]
    async fn direct_link_returns_canonical_url_unchanged() {
        let downloader = Downloader::new("/tmp/downloads".to_string());
        let messaging: Arc<dyn MessagingClient> = Arc::new(FakeMessagingClient::new(1));
        let mut t = track(Platform::DirectLink);
        let result = downloader.download(&messaging, &mut t).await.unwrap();
        assert_eq!(result, "https://example.com/abc");
    }

    #[tokio::test]
    async fn youtube_track_passes_through_cdn_url() {
        let downloader = Downloader::new("/tmp/downloads".to_string());
        let messaging: Arc<dyn MessagingClient> = Arc::new(FakeMessagingClient::new(1));
        let mut t = track(Platform::Youtube);
        let result = downloader.download(&messaging, &mut t).await.unwrap();
        assert_eq!(result, "https://cdn.example.com/abc.mp3");
    }

    #[tokio::test]
    async fn telegram_media_downloads_by_file_id() {
        let downloader = Downloader::new("/tmp/downloads".to_string());
        let messaging: Arc<dyn MessagingClient> = Arc::new(FakeMessagingClient::new(1));
        let mut t = track(Platform::TelegramMedia);
        let result = downloader.download(&messaging, &mut t).await.unwrap();
        assert_eq!(result, "/tmp/downloads/abc");
    }

    #[test]
    fn sanitize_name_replaces_unsafe_characters() {
        assert_eq!(sanitize_name("t.me/chan/5"), "t.me_chan_5");
    }

    #[test]
    fn deep_link_detection() {
        assert!(is_messaging_deep_link("t.me/somechannel/42"));
        assert!(!is_messaging_deep_link("https://cdn.example.com/a.mp3"));
    }
}
