//! The API-gateway adapter.
//!
//! Grounded in `original_source/src/core/dl/api.go`'s `ApiData`: a thin
//! proxy to a single configured HTTP endpoint that resolves a YouTube-family
//! URL (or, generalized here, a bare search query) to `{status, title,
//! thumbnail, audio}`.

use crate::error::{EngineError, Result};
use crate::queue::{Platform, TrackInfo};
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

static YT_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)^(?:https?://)?(?:www\.)?(?:youtube\.com|music\.youtube\.com)/(?:playlist|watch)\?.*\blist=([\w-]+)").unwrap(),
        Regex::new(r"(?i)^(?:https?://)?music\.youtube\.com/(?:watch|playlist)\?.*v=([\w-]+)").unwrap(),
    ]
});

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: bool,
    title: String,
    thumbnail: String,
    audio: String,
}

/// Proxies track lookups to a single configured API endpoint.
pub struct ApiGatewayAdapter {
    http: reqwest::Client,
    api_url: Option<String>,
    api_key: Option<String>,
}

impl ApiGatewayAdapter {
    #[must_use]
    pub fn new(api_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url,
            api_key,
        }
    }

    /// True for a recognized YouTube-family URL. An unconfigured `api_url`
    /// always fails validation, matching `ApiData.IsValid`.
    #[must_use]
    pub fn is_valid(&self, query: &str) -> bool {
        let Some(api_url) = &self.api_url else {
            return false;
        };
        if query.is_empty() || api_url.is_empty() {
            return false;
        }
        YT_PATTERNS.iter().any(|p| p.is_match(query))
            || query.contains("youtube.com")
            || query.contains("youtu.be")
    }

    /// Resolves a single track for `query`, whether it is a YouTube URL or
    /// (generalized beyond the original's URL-only contract, per the
    /// resolver's default-service dispatch) a free-text query sent verbatim
    /// to the same endpoint.
    pub async fn get_track(&self, query: &str) -> Result<TrackInfo> {
        let api_url = self
            .api_url
            .as_deref()
            .ok_or_else(|| EngineError::ResolveFailed(anyhow::anyhow!("no API URL configured")))?;

        let mut req = self.http.get(api_url).query(&[("url", query)]);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))?;

        if !resp.status().is_success() {
            return Err(EngineError::ResolveFailed(anyhow::anyhow!(
                "unexpected status code while fetching the track: {}",
                resp.status()
            )));
        }

        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::ResolveFailed(e.into()))?;

        if !body.status {
            return Err(EngineError::ResolveFailed(anyhow::anyhow!(
                "API returned false status"
            )));
        }

        Ok(TrackInfo {
            id: query.to_string(),
            title: body.title,
            duration_seconds: 0,
            platform: Platform::Youtube,
            cover_url: (!body.thumbnail.is_empty()).then_some(body.thumbnail),
            canonical_url: query.to_string(),
            cdn_url: (!body.audio.is_empty()).then_some(body.audio),
        })
    }

    pub async fn get_info(&self, query: &str) -> Result<Vec<TrackInfo>> {
        Ok(vec![self.get_track(query).await?])
    }

    /// Free-text search dispatch: the same endpoint handles both a YouTube
    /// URL and a bare query string, since no distinct Spotify adapter
    /// exists anywhere in the retrieved sources.
    pub async fn search(&self, query: &str) -> Result<Vec<TrackInfo>> {
        self.get_info(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_api_url_is_never_valid() {
        let adapter = ApiGatewayAdapter::new(None, None);
        assert!(!adapter.is_valid("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn recognizes_youtube_playlist_urls() {
        let adapter = ApiGatewayAdapter::new(Some("https://example.test".into()), None);
        assert!(adapter.is_valid("https://www.youtube.com/playlist?list=PL123"));
    }

    #[test]
    fn recognizes_bare_youtube_substrings() {
        let adapter = ApiGatewayAdapter::new(Some("https://example.test".into()), None);
        assert!(adapter.is_valid("https://youtu.be/abc123"));
    }
}
