//! Process configuration.
//!
//! Loaded from environment variables plus an optional set of env files read
//! with a hand-rolled parser (see `parse_env_file`) that supplements, rather
//! than replaces, `dotenvy`'s own `.env` support in `main`.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::env;
use std::path::Path;

/// Maximum numbered session-string suffix the loader will look for
/// (`STRING1` through `STRING10`), matching the original bot's session pool
/// size.
const MAX_NUMBERED_SESSIONS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Pyrogram,
    Telethon,
    Gogram,
}

impl SessionType {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "telethon" => Self::Telethon,
            "gogram" => Self::Gogram,
            _ => Self::Pyrogram,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultService {
    Youtube,
    Spotify,
}

impl DefaultService {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "spotify" => Self::Spotify,
            _ => Self::Youtube,
        }
    }
}

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_id: i32,
    pub api_hash: String,
    pub bot_token: String,
    /// Assistant session strings, in pool order.
    pub session_strings: Vec<String>,
    pub session_type: SessionType,
    /// Connection URI for the external document store.
    pub document_store_uri: String,
    pub owner_id: i64,
    /// Optional chat that receives operational echo messages.
    pub logger_id: Option<i64>,
    pub default_service: DefaultService,
    pub max_file_size: u64,
    pub song_duration_limit: u64,
    pub downloads_dir: String,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub proxy: Option<String>,
    pub cookie_urls: Vec<String>,
    pub cookies_path: String,
    pub support_group: Option<String>,
    pub support_channel: Option<String>,
    pub devs: Vec<i64>,
    pub metrics_port: u16,
}

impl Config {
    /// Build configuration from the process environment, after it has been
    /// overlaid with any `.env`-style files named in `env_files`.
    pub fn from_env(env_files: &[impl AsRef<Path>]) -> Result<Self> {
        let mut overlay = HashMap::new();
        for path in env_files {
            let loaded = parse_env_file(path.as_ref())
                .with_context(|| format!("loading env file {}", path.as_ref().display()))?;
            overlay.extend(loaded);
        }

        let get = |key: &str| -> Option<String> {
            overlay
                .get(key)
                .cloned()
                .or_else(|| env::var(key).ok())
                .filter(|v| !v.is_empty())
        };

        let api_id: i32 = get("API_ID")
            .context("API_ID must be set")?
            .parse()
            .context("API_ID must be an integer")?;
        let api_hash = get("API_HASH").context("API_HASH must be set")?;
        let bot_token = get("TOKEN").context("TOKEN must be set")?;
        let document_store_uri = get("DATABASE_URI")
            .or_else(|| get("MONGO_URI"))
            .context("DATABASE_URI must be set")?;
        let owner_id: i64 = get("OWNER_ID")
            .context("OWNER_ID must be set")?
            .parse()
            .context("OWNER_ID must be an integer")?;

        let session_strings = session_strings(&get, "STRING", MAX_NUMBERED_SESSIONS);
        if session_strings.is_empty() {
            bail!("at least one assistant session string (STRING or STRING1..10) must be set");
        }

        let session_type =
            get("SESSION_TYPE").map_or(SessionType::Pyrogram, |v| SessionType::parse(&v));

        let default_service = get("DEFAULT_SERVICE").map_or(DefaultService::Youtube, |v| {
            let svc = DefaultService::parse(&v);
            let lower = v.to_ascii_lowercase();
            if lower != "youtube" && lower != "spotify" {
                tracing::warn!(value = %v, "invalid DEFAULT_SERVICE, defaulting to youtube");
            }
            svc
        });

        let downloads_dir = get("DOWNLOADS_DIR").unwrap_or_else(|| "/tmp/downloads".to_string());

        let devs = get("DEVS")
            .map(|raw| {
                raw.split(|c: char| c == ',' || c == ' ' || c == '\n')
                    .filter_map(|s| s.trim().parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default();

        let cookie_urls = get("COOKIES_URL")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            api_id,
            api_hash,
            bot_token,
            session_strings,
            session_type,
            document_store_uri,
            owner_id,
            logger_id: get("LOGGER_ID").and_then(|v| v.parse().ok()),
            default_service,
            max_file_size: get("MAX_FILE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(500 * 1024 * 1024),
            song_duration_limit: get("SONG_DURATION_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            cookies_path: "cache/cookies".to_string(),
            downloads_dir,
            api_url: get("API_URL"),
            api_key: get("API_KEY"),
            proxy: get("PROXY"),
            cookie_urls,
            support_group: get("SUPPORT_GROUP"),
            support_channel: get("SUPPORT_CHANNEL"),
            devs,
            metrics_port: get("METRICS_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(6060),
        })
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            api_id: 12345,
            api_hash: "test-hash".into(),
            bot_token: "test-token".into(),
            session_strings: vec!["test-session".into()],
            session_type: SessionType::Pyrogram,
            document_store_uri: "redis://localhost:6380".into(),
            owner_id: 1,
            logger_id: None,
            default_service: DefaultService::Youtube,
            max_file_size: 500 * 1024 * 1024,
            song_duration_limit: 3600,
            downloads_dir: "/tmp/downloads".into(),
            api_url: None,
            api_key: None,
            proxy: None,
            cookie_urls: Vec::new(),
            cookies_path: "cache/cookies".into(),
            support_group: None,
            support_channel: None,
            devs: Vec::new(),
            metrics_port: 6060,
        }
    }
}

/// Collects `PREFIX1..PREFIXmax` plus a bare, un-numbered `PREFIX`, the way
/// `original_source/src/config/types.go`'s `getSessionStrings` does.
fn session_strings(get: &impl Fn(&str) -> Option<String>, prefix: &str, max: u32) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(v) = get(prefix) {
        out.push(v);
    }
    for i in 1..=max {
        if let Some(v) = get(&format!("{prefix}{i}")) {
            out.push(v);
        }
    }
    out
}

/// Parses a single env file with the quirky, hand-rolled grammar the
/// original bot used (`loadSingleEnvFile` / `unquoteValue`):
///
/// - `#`-prefixed and blank lines are skipped.
/// - a line beginning with whitespace continues the previous value, joined
///   with `\n`.
/// - an inline ` #` marks a trailing comment, trimmed from the value.
/// - a trailing `\` marks line continuation: following lines are appended
///   without an inserted newline until one doesn't end in `\`.
/// - surrounding matching `'...'` or `"..."` are stripped.
/// - lines without `=` are skipped.
pub fn parse_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_env_str(&contents))
}

fn parse_env_str(contents: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut lines = contents.lines().peekable();
    let mut current_key: Option<String> = None;

    while let Some(raw_line) = lines.next() {
        if raw_line.starts_with(' ') || raw_line.starts_with('\t') {
            if let Some(key) = &current_key {
                let continuation = raw_line.trim();
                out.entry(key.clone()).and_modify(|v: &mut String| {
                    v.push('\n');
                    v.push_str(continuation);
                });
            }
            continue;
        }

        let trimmed = raw_line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some(eq_idx) = trimmed.find('=') else {
            tracing::debug!(line = %trimmed, "skipping invalid env line (no '=')");
            continue;
        };

        let key = trimmed[..eq_idx].trim().to_string();
        let mut value = trimmed[eq_idx + 1..].to_string();

        // Trailing-`\` line continuation: accumulate without inserting a
        // newline until a line doesn't end in `\`.
        while value.trim_end().ends_with('\\') {
            let Some(next_line) = lines.next() else {
                break;
            };
            let stripped = value.trim_end();
            value = format!("{}{}", &stripped[..stripped.len() - 1], next_line.trim());
        }

        let value = unquote_value(strip_inline_comment(&value));
        current_key = Some(key.clone());
        out.insert(key, value);
    }

    out
}

/// Trims a ` #...` trailing comment from a value, ignoring `#` that isn't
/// preceded by whitespace (so `K=a#b` is left alone).
fn strip_inline_comment(value: &str) -> &str {
    if let Some(idx) = value.find(" #") {
        value[..idx].trim_end()
    } else {
        value.trim()
    }
}

fn unquote_value(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_assignment() {
        let env = parse_env_str("K1=a\n");
        assert_eq!(env.get("K1"), Some(&"a".to_string()));
    }

    #[test]
    fn strips_matching_quotes() {
        let env = parse_env_str("K2=\"quoted\"\n");
        assert_eq!(env.get("K2"), Some(&"quoted".to_string()));
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let env = parse_env_str("# a comment\n\nK1=a\n");
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("K1"), Some(&"a".to_string()));
    }

    #[test]
    fn strips_inline_trailing_comment() {
        let env = parse_env_str("K4=z # tail\n");
        assert_eq!(env.get("K4"), Some(&"z".to_string()));
    }

    #[test]
    fn joins_indented_continuation_lines_with_newline() {
        let env = parse_env_str("K1=first\n  second\n");
        assert_eq!(env.get("K1"), Some(&"first\nsecond".to_string()));
    }

    #[test]
    fn trailing_backslash_concatenates_without_newline() {
        let env = parse_env_str("K3=x\\\ny\n");
        assert_eq!(env.get("K3"), Some(&"xy".to_string()));
    }

    #[test]
    fn skips_lines_without_equals() {
        let env = parse_env_str("not a valid line\nK1=a\n");
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn numbered_session_strings_collected_in_order() {
        let mut map = HashMap::new();
        map.insert("STRING".to_string(), "base".to_string());
        map.insert("STRING2".to_string(), "two".to_string());
        map.insert("STRING1".to_string(), "one".to_string());
        let get = |key: &str| map.get(key).cloned();
        let sessions = session_strings(&get, "STRING", MAX_NUMBERED_SESSIONS);
        assert_eq!(sessions, vec!["base", "one", "two"]);
    }
}

