//! The direct-link adapter.
//!
//! Grounded in `original_source/src/core/dl/direct_link.go`: a bare http(s)
//! URL that is itself the playable media, identified by probing its
//! container metadata with `ffprobe` rather than by a platform regex.

use crate::error::{EngineError, Result};
use crate::queue::{Platform, TrackInfo};
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const MAX_TITLE_LEN: usize = 30;

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    format: FormatSection,
}

#[derive(Debug, Default, Deserialize)]
struct FormatSection {
    duration: Option<String>,
    tags: Option<FormatTags>,
}

#[derive(Debug, Default, Deserialize)]
struct FormatTags {
    title: Option<String>,
}

pub struct DirectLinkAdapter;

impl DirectLinkAdapter {
    #[must_use]
    pub fn is_valid(query: &str) -> bool {
        query.starts_with("http://") || query.starts_with("https://")
    }

    /// Probes `query` with `ffprobe -show_format` under a 5 s deadline;
    /// any failure propagates as `ResolveFailed`.
    pub async fn get_info(query: &str) -> Result<TrackInfo> {
        if !Self::is_valid(query) {
            return Err(EngineError::ResolveFailed(anyhow::anyhow!("invalid url")));
        }

        let output = timeout(
            Duration::from_secs(5),
            Command::new("ffprobe")
                .args(["-v", "quiet", "-print_format", "json", "-show_format", query])
                .output(),
        )
        .await
        .map_err(|_| EngineError::ResolveFailed(anyhow::anyhow!("ffprobe probe timed out")))?
        .map_err(|e| EngineError::ResolveFailed(e.into()))?;

        if !output.status.success() {
            return Err(EngineError::ResolveFailed(anyhow::anyhow!(
                "invalid or unplayable link"
            )));
        }

        let parsed: FfprobeFormat = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::ResolveFailed(e.into()))?;

        let duration_seconds = parsed
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0) as u64;

        let mut title = parsed
            .format
            .tags
            .and_then(|t| t.title)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| fallback_title(query));

        if title.chars().count() > MAX_TITLE_LEN {
            title = title.chars().take(MAX_TITLE_LEN - 3).collect::<String>() + "...";
        }

        Ok(TrackInfo {
            id: query.to_string(),
            title,
            duration_seconds,
            platform: Platform::DirectLink,
            cover_url: None,
            canonical_url: query.to_string(),
            cdn_url: Some(query.to_string()),
        })
    }
}

/// Derives a title from the URL's last path segment when the container
/// carries no title tag, stripping any query string or fragment.
fn fallback_title(query: &str) -> String {
    let segment = query
        .rsplit('/')
        .next()
        .unwrap_or(query)
        .split(['?', '#'])
        .next()
        .unwrap_or("");
    let decoded = percent_decode(segment);
    if decoded.is_empty() {
        "Direct Link".to_string()
    } else {
        decoded
    }
}

/// Minimal `%XX` percent-decoder; invalid escapes are passed through
/// unchanged rather than failing the whole title.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_http_and_https_only() {
        assert!(DirectLinkAdapter::is_valid("https://cdn.example/a.mp3"));
        assert!(DirectLinkAdapter::is_valid("http://cdn.example/a.mp3"));
        assert!(!DirectLinkAdapter::is_valid("ftp://cdn.example/a.mp3"));
        assert!(!DirectLinkAdapter::is_valid("just a query"));
    }

    #[test]
    fn fallback_title_strips_query_and_fragment() {
        assert_eq!(
            fallback_title("https://cdn.example/song.mp3?sig=abc#frag"),
            "song.mp3"
        );
    }

    #[test]
    fn fallback_title_falls_back_when_empty() {
        assert_eq!(fallback_title("https://cdn.example/"), "Direct Link");
    }

    #[test]
    fn percent_decode_handles_space_escapes() {
        assert_eq!(percent_decode("My%20Song"), "My Song");
    }

    #[test]
    fn long_titles_are_truncated() {
        let long = "a".repeat(40);
        let truncated = if long.chars().count() > MAX_TITLE_LEN {
            long.chars().take(MAX_TITLE_LEN - 3).collect::<String>() + "..."
        } else {
            long.clone()
        };
        assert_eq!(truncated.chars().count(), MAX_TITLE_LEN);
    }
}
