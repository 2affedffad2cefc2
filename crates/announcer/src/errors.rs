//! Announcer error types.
//!
//! The taxonomy separates failures by blast radius: `Media` and `Config` are
//! startup-fatal, everything else is local to one request, one event, or one
//! upload and must never take down the subscription loop.

use common::token_manager::TokenError;
use thiserror::Error;

/// Announcer error type.
#[derive(Debug, Error)]
pub enum AnnouncerError {
    /// Credential acquisition or re-acquisition failed, or a request stayed
    /// unauthorized after one refresh-and-retry.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Non-auth HTTP or network failure on a single call.
    #[error("Request error: {0}")]
    Request(String),

    /// Participant status fetch failed; the triggering event is dropped.
    #[error("Participant lookup failed: {0}")]
    Lookup(String),

    /// Upload transport failure; that single upload is abandoned.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Upload terminated by the external cancellation signal.
    #[error("Stream cancelled")]
    StreamCancelled,

    /// Malformed inbound event message; the message is discarded.
    #[error("Event parse error: {0}")]
    Parse(String),

    /// Media asset missing or unreadable.
    #[error("Media error: {0}")]
    Media(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AnnouncerError {
    /// Whether this error is the cancellation outcome of an upload.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AnnouncerError::StreamCancelled)
    }
}

impl From<TokenError> for AnnouncerError {
    fn from(err: TokenError) -> Self {
        AnnouncerError::Auth(err.to_string())
    }
}

impl From<crate::config::ConfigError> for AnnouncerError {
    fn from(err: crate::config::ConfigError) -> Self {
        AnnouncerError::Config(err.to_string())
    }
}
