//! Announcer configuration.
//!
//! Configuration is loaded from environment variables. The client secret is
//! redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default delay between event-feed reconnect attempts, in seconds.
pub const DEFAULT_RECONNECT_DELAY_SECONDS: u64 = 5;

/// Path of the call-control event feed, relative to the base URL.
pub const EVENTS_PATH: &str = "/callcontrol/ws";

/// Announcer configuration.
///
/// Loaded from environment variables. Sensitive fields are redacted in
/// Debug output.
#[derive(Clone)]
pub struct Config {
    /// PBX API base URL (e.g., `https://pbx.example.com`).
    pub base_url: String,

    /// OAuth client ID for the client-credentials exchange.
    pub client_id: String,

    /// OAuth client secret.
    /// Protected by `SecretString` to prevent accidental logging.
    pub client_secret: SecretString,

    /// Source extension (DN) used for call-control operations.
    pub extension: String,

    /// Path to the WAV asset streamed to connected participants.
    pub audio_path: String,

    /// Delay between event-feed reconnect attempts, in seconds (default: 5).
    pub reconnect_delay_seconds: u64,

    /// Optional destination to dial once at startup.
    pub dial_destination: Option<String>,
}

/// Custom Debug implementation that redacts the client secret.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("extension", &self.extension)
            .field("audio_path", &self.audio_path)
            .field("reconnect_delay_seconds", &self.reconnect_delay_seconds)
            .field("dial_destination", &self.dial_destination)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let base_url = vars
            .get("ANNOUNCER_BASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("ANNOUNCER_BASE_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(format!(
                "ANNOUNCER_BASE_URL must start with http:// or https://, got {base_url}"
            )));
        }

        let client_id = vars
            .get("ANNOUNCER_CLIENT_ID")
            .ok_or_else(|| ConfigError::MissingEnvVar("ANNOUNCER_CLIENT_ID".to_string()))?
            .clone();

        let client_secret = SecretString::from(
            vars.get("ANNOUNCER_CLIENT_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("ANNOUNCER_CLIENT_SECRET".to_string()))?
                .clone(),
        );

        let extension = vars
            .get("ANNOUNCER_EXTENSION")
            .ok_or_else(|| ConfigError::MissingEnvVar("ANNOUNCER_EXTENSION".to_string()))?
            .clone();

        let audio_path = vars
            .get("ANNOUNCER_AUDIO_PATH")
            .ok_or_else(|| ConfigError::MissingEnvVar("ANNOUNCER_AUDIO_PATH".to_string()))?
            .clone();

        let reconnect_delay_seconds = vars
            .get("ANNOUNCER_RECONNECT_DELAY_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RECONNECT_DELAY_SECONDS);

        let dial_destination = vars
            .get("ANNOUNCER_DIAL_DESTINATION")
            .filter(|s| !s.is_empty())
            .cloned();

        Ok(Config {
            base_url,
            client_id,
            client_secret,
            extension,
            audio_path,
            reconnect_delay_seconds,
            dial_destination,
        })
    }

    /// URL of the call-control event feed, with the scheme mapped to
    /// WebSocket (`http` → `ws`, `https` → `wss`).
    #[must_use]
    pub fn events_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            // from_vars rejects other schemes; keep the value usable anyway
            self.base_url.clone()
        };
        format!("{ws_base}{EVENTS_PATH}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "ANNOUNCER_BASE_URL".to_string(),
                "https://pbx.example.com".to_string(),
            ),
            (
                "ANNOUNCER_CLIENT_ID".to_string(),
                "announcer-app".to_string(),
            ),
            (
                "ANNOUNCER_CLIENT_SECRET".to_string(),
                "shh-very-secret".to_string(),
            ),
            ("ANNOUNCER_EXTENSION".to_string(), "111".to_string()),
            (
                "ANNOUNCER_AUDIO_PATH".to_string(),
                "/srv/announce.wav".to_string(),
            ),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.base_url, "https://pbx.example.com");
        assert_eq!(config.client_id, "announcer-app");
        assert_eq!(config.client_secret.expose_secret(), "shh-very-secret");
        assert_eq!(config.extension, "111");
        assert_eq!(config.audio_path, "/srv/announce.wav");
        assert_eq!(
            config.reconnect_delay_seconds,
            DEFAULT_RECONNECT_DELAY_SECONDS
        );
        assert!(config.dial_destination.is_none());
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "ANNOUNCER_RECONNECT_DELAY_SECONDS".to_string(),
            "2".to_string(),
        );
        vars.insert(
            "ANNOUNCER_DIAL_DESTINATION".to_string(),
            "0400123456".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.reconnect_delay_seconds, 2);
        assert_eq!(config.dial_destination.as_deref(), Some("0400123456"));
    }

    #[test]
    fn test_missing_required_vars() {
        for key in [
            "ANNOUNCER_BASE_URL",
            "ANNOUNCER_CLIENT_ID",
            "ANNOUNCER_CLIENT_SECRET",
            "ANNOUNCER_EXTENSION",
            "ANNOUNCER_AUDIO_PATH",
        ] {
            let mut vars = base_vars();
            vars.remove(key);

            let result = Config::from_vars(&vars);
            assert!(
                matches!(result, Err(ConfigError::MissingEnvVar(ref v)) if v == key),
                "expected MissingEnvVar for {key}"
            );
        }
    }

    #[test]
    fn test_base_url_scheme_validation() {
        let mut vars = base_vars();
        vars.insert(
            "ANNOUNCER_BASE_URL".to_string(),
            "ftp://pbx.example.com".to_string(),
        );

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let mut vars = base_vars();
        vars.insert(
            "ANNOUNCER_BASE_URL".to_string(),
            "https://pbx.example.com/".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");
        assert_eq!(config.base_url, "https://pbx.example.com");
    }

    #[test]
    fn test_events_url_scheme_mapping() {
        let config = Config::from_vars(&base_vars()).unwrap();
        assert_eq!(config.events_url(), "wss://pbx.example.com/callcontrol/ws");

        let mut vars = base_vars();
        vars.insert(
            "ANNOUNCER_BASE_URL".to_string(),
            "http://127.0.0.1:5000".to_string(),
        );
        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.events_url(), "ws://127.0.0.1:5000/callcontrol/ws");
    }

    #[test]
    fn test_debug_redacts_client_secret() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("shh-very-secret"));
    }

    #[test]
    fn test_unparseable_reconnect_delay_falls_back_to_default() {
        let mut vars = base_vars();
        vars.insert(
            "ANNOUNCER_RECONNECT_DELAY_SECONDS".to_string(),
            "soon".to_string(),
        );

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(
            config.reconnect_delay_seconds,
            DEFAULT_RECONNECT_DELAY_SECONDS
        );
    }
}
