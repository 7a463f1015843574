//! Crate-wide error taxonomy.
//!
//! Every module-level error type (config, resolver, downloader, call
//! controller, ...) converts into this one at its public boundary, matching
//! the teacher's per-module `thiserror` enums composed behind a single
//! response type.

use std::time::Duration;

/// The error kinds the core can produce, independent of which component
/// raised them.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("index out of range")]
    OutOfRange,

    #[error("assistant authentication failed: {0}")]
    AuthFailed(String),

    #[error("assistant session string could not be decoded: {0}")]
    SessionFormat(String),

    #[error("account is a bot, not a user account")]
    NotUserAccount,

    #[error("failed to resolve track: {0}")]
    ResolveFailed(#[source] anyhow::Error),

    #[error("failed to download track: {0}")]
    DownloadFailed(#[source] anyhow::Error),

    #[error("failed to join call: {0}")]
    JoinFailed(String),

    #[error("call connection failed")]
    ConnectionFailed,

    #[error("timed out waiting for connection")]
    ConnectionTimeout,

    /// Always retried once by the caller; never surfaced to the user.
    #[error("flood wait: retry after {0:?}")]
    FloodWait(Duration),

    #[error("native RTC binding reported an unrecoverable state: {0}")]
    Fatal(String),

    #[error("seek target is beyond the track's duration")]
    SeekBeyondDuration,
}

impl EngineError {
    /// Whether this error is safe to relay verbatim to the user via the
    /// command reply, per the propagation policy.
    #[must_use]
    pub const fn user_facing(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_)
                | Self::NotFound(_)
                | Self::OutOfRange
                | Self::ResolveFailed(_)
                | Self::DownloadFailed(_)
                | Self::JoinFailed(_)
                | Self::SeekBeyondDuration
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
