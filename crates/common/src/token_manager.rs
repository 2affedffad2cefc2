//! OAuth 2.0 client-credentials token management.
//!
//! Acquires bearer tokens from the PBX identity endpoint on demand and
//! refreshes them when expiry inspection says they are stale. The manager is
//! an injected instance shared via `Arc` — there is no ambient process-global
//! credential.
//!
//! # Refresh coordination
//!
//! The current credential and the exchange path share one `tokio::sync::Mutex`,
//! so at most one exchange is in flight at a time. Concurrent callers that
//! discover an expired credential await the same refresh result instead of
//! issuing redundant exchanges.
//!
//! # Security
//!
//! - Client secret and token values are stored as `SecretString` (never logged)
//! - Acquisition events are logged without values
//! - HTTP timeouts prevent hanging connections

use crate::jwt;
use crate::secret::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Default HTTP request timeout for the token exchange.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default connection timeout for the HTTP client.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur during token management.
#[derive(Error, Debug, Clone)]
pub enum TokenError {
    /// HTTP client error (transport-level failure).
    #[error("HTTP client error: {0}")]
    HttpError(String),

    /// Credentials rejected by the identity endpoint (401, 400).
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// Token response parsing failed.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Configuration for the token manager.
#[derive(Clone)]
pub struct TokenManagerConfig {
    /// PBX API base URL (e.g., `https://pbx.example.com`).
    pub base_url: String,

    /// OAuth client ID.
    pub client_id: String,

    /// OAuth client secret (as `SecretString`).
    pub client_secret: SecretString,

    /// HTTP request timeout for the exchange.
    pub http_timeout: Duration,
}

impl std::fmt::Debug for TokenManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManagerConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl TokenManagerConfig {
    /// Create a new configuration with the default timeout.
    #[must_use]
    pub fn new(base_url: String, client_id: String, client_secret: SecretString) -> Self {
        Self {
            base_url,
            client_id,
            client_secret,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Set the HTTP timeout.
    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}

/// A bearer credential with its derived expiry.
///
/// The expiry is derived once at acquisition: the JWT `exp` claim when the
/// token is decodable, else `now + expires_in` from the token response, else
/// zero — an underivable expiry means the credential always reads as
/// expired, forcing a refresh before use.
#[derive(Clone)]
pub struct Credential {
    token: SecretString,
    expires_at: i64,
}

impl Credential {
    /// Whether this credential must not be used at `now` (Unix epoch seconds).
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// The `Authorization` header value for this credential.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }

    /// Expiry as Unix epoch seconds.
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Build a credential directly, bypassing the identity endpoint.
    ///
    /// Test suites use this to inject credentials without a mock exchange.
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn for_tests(token: &str, expires_at: i64) -> Self {
        Self {
            token: SecretString::from(token),
            expires_at,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// OAuth 2.0 token response from the identity endpoint.
#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[allow(dead_code)]
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl std::fmt::Debug for OAuthTokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// On-demand token manager for the client-credentials flow.
pub struct TokenManager {
    config: TokenManagerConfig,
    http_client: reqwest::Client,
    current: Mutex<Option<Credential>>,
}

impl TokenManager {
    /// Create a token manager.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Configuration` if the HTTP client cannot be built.
    pub fn new(config: TokenManagerConfig) -> Result<Self, TokenError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TokenError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            http_client,
            current: Mutex::new(None),
        })
    }

    /// The current credential, if any has been acquired.
    pub async fn current(&self) -> Option<Credential> {
        self.current.lock().await.clone()
    }

    /// Force a new exchange and replace the current credential.
    ///
    /// Used at startup and by the single 401-retry path.
    ///
    /// # Errors
    ///
    /// Returns `TokenError` if the exchange fails; the previous credential
    /// (if any) is left in place.
    pub async fn acquire(&self) -> Result<Credential, TokenError> {
        let mut slot = self.current.lock().await;
        let credential = self.exchange().await?;
        *slot = Some(credential.clone());
        Ok(credential)
    }

    /// A non-expired credential: the current one when still valid, else the
    /// result of a refresh.
    ///
    /// Holding the lock across the exchange is what serializes concurrent
    /// refreshes.
    ///
    /// # Errors
    ///
    /// Returns `TokenError` if a refresh was needed and failed.
    pub async fn fresh(&self) -> Result<Credential, TokenError> {
        let mut slot = self.current.lock().await;

        let now = chrono::Utc::now().timestamp();
        if let Some(credential) = slot.as_ref() {
            if !credential.is_expired(now) {
                return Ok(credential.clone());
            }
            debug!(
                target: "common.token_manager",
                expires_at = credential.expires_at,
                "Current credential expired, refreshing"
            );
        }

        let credential = self.exchange().await?;
        *slot = Some(credential.clone());
        Ok(credential)
    }

    /// Perform one client-credentials exchange.
    async fn exchange(&self) -> Result<Credential, TokenError> {
        let url = format!("{}/connect/token", self.config.base_url);

        debug!(
            target: "common.token_manager",
            client_id = %self.config.client_id,
            url = %url,
            "Requesting token from identity endpoint"
        );

        let form_body = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("grant_type", "client_credentials"),
        ];

        let response = self
            .http_client
            .post(&url)
            .form(&form_body)
            .send()
            .await
            .map_err(|e| {
                debug!(target: "common.token_manager", error = %e, "HTTP request failed");
                TokenError::HttpError(e.to_string())
            })?;

        let status = response.status();

        if status.is_success() {
            let token_response: OAuthTokenResponse = response.json().await.map_err(|e| {
                warn!(target: "common.token_manager", error = %e, "Failed to parse token response");
                TokenError::InvalidResponse(e.to_string())
            })?;

            let now = chrono::Utc::now().timestamp();
            #[allow(clippy::cast_possible_wrap)]
            let expires_at = jwt::expiry(&token_response.access_token)
                .or_else(|| token_response.expires_in.map(|secs| now + secs as i64))
                .unwrap_or_else(|| {
                    warn!(
                        target: "common.token_manager",
                        "Token expiry underivable (no exp claim, no expires_in); treating as already expired"
                    );
                    0
                });

            debug!(
                target: "common.token_manager",
                expires_at,
                "Token acquired successfully"
            );

            Ok(Credential {
                token: SecretString::from(token_response.access_token),
                expires_at,
            })
        } else if status.as_u16() == 401 || status.as_u16() == 400 {
            // Body is logged at trace level only; it may echo credential material.
            let body = response.text().await.unwrap_or_else(|e| {
                trace!(target: "common.token_manager", error = %e, "Failed to read error response body");
                "<failed to read body>".to_string()
            });
            warn!(
                target: "common.token_manager",
                status = %status,
                "Credentials rejected by identity endpoint"
            );
            trace!(
                target: "common.token_manager",
                body = %body,
                "Rejection response body"
            );
            Err(TokenError::AuthenticationRejected(format!(
                "Status {status}"
            )))
        } else {
            warn!(
                target: "common.token_manager",
                status = %status,
                "Unexpected response from identity endpoint"
            );
            Err(TokenError::HttpError(format!(
                "Unexpected status: {status}"
            )))
        }
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> TokenManagerConfig {
        TokenManagerConfig::new(
            base_url.to_string(),
            "test-client".to_string(),
            SecretString::from("test-secret"),
        )
    }

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::json!({ "exp": exp }).to_string());
        format!("{header}.{payload}.sig")
    }

    // =========================================================================
    // Credential tests
    // =========================================================================

    #[test]
    fn test_is_expired_truth_table() {
        let cred = Credential::for_tests("tok", 1000);
        assert!(!cred.is_expired(999));
        assert!(cred.is_expired(1000));
        assert!(cred.is_expired(1001));

        // Fail-closed: underivable expiry is stored as 0, expired at any time
        let closed = Credential::for_tests("tok", 0);
        assert!(closed.is_expired(0));
        assert!(closed.is_expired(1));
    }

    #[test]
    fn test_bearer_prefix() {
        let cred = Credential::for_tests("abc", 1000);
        assert_eq!(cred.bearer(), "Bearer abc");
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let cred = Credential::for_tests("secret-token-value", 1000);
        let debug_str = format!("{cred:?}");
        assert!(debug_str.contains("[REDACTED]"));
        assert!(debug_str.contains("1000"));
        assert!(!debug_str.contains("secret-token-value"));
    }

    #[test]
    fn test_config_debug_redacts_secret() {
        let config = test_config("http://localhost");
        let debug_str = format!("{config:?}");
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("test-secret"));
    }

    #[test]
    fn test_config_builder() {
        let config = test_config("http://localhost").with_http_timeout(Duration::from_secs(3));
        assert_eq!(config.http_timeout, Duration::from_secs(3));
    }

    // =========================================================================
    // Exchange tests
    // =========================================================================

    #[tokio::test]
    async fn test_acquire_sends_client_credentials_form() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=test-client"))
            .and(body_string_contains("client_secret=test-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "acquired-token",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let manager = TokenManager::new(test_config(&mock_server.uri())).unwrap();
        let credential = manager.acquire().await.unwrap();

        assert_eq!(credential.bearer(), "Bearer acquired-token");
        assert!(manager.current().await.is_some());
    }

    #[tokio::test]
    async fn test_opaque_token_expiry_from_expires_in() {
        let mock_server = MockServer::start().await;

        // An opaque token with a 1-hour expiry must not read as expired
        // immediately, and must read as expired an hour later.
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&mock_server)
            .await;

        let manager = TokenManager::new(test_config(&mock_server.uri())).unwrap();
        let credential = manager.acquire().await.unwrap();

        let now = chrono::Utc::now().timestamp();
        assert!(!credential.is_expired(now));
        assert!(credential.is_expired(now + 3601));
    }

    #[tokio::test]
    async fn test_jwt_exp_claim_preferred_over_expires_in() {
        let mock_server = MockServer::start().await;
        let token = jwt_with_exp(1_800_000_000);

        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": token,
                "token_type": "Bearer",
                "expires_in": 60
            })))
            .mount(&mock_server)
            .await;

        let manager = TokenManager::new(test_config(&mock_server.uri())).unwrap();
        let credential = manager.acquire().await.unwrap();

        assert_eq!(credential.expires_at(), 1_800_000_000);
    }

    #[tokio::test]
    async fn test_underivable_expiry_fails_closed() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "opaque-no-expiry"
            })))
            .mount(&mock_server)
            .await;

        let manager = TokenManager::new(test_config(&mock_server.uri())).unwrap();
        let credential = manager.acquire().await.unwrap();

        assert_eq!(credential.expires_at(), 0);
        assert!(credential.is_expired(chrono::Utc::now().timestamp()));
    }

    #[tokio::test]
    async fn test_401_rejection() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(
                ResponseTemplate::new(401).set_body_string(r#"{"error": "invalid_client"}"#),
            )
            .mount(&mock_server)
            .await;

        let manager = TokenManager::new(test_config(&mock_server.uri())).unwrap();
        let result = manager.acquire().await;

        assert!(matches!(result, Err(TokenError::AuthenticationRejected(_))));
        // Failed acquisition must not clobber state with a broken credential
        assert!(manager.current().await.is_none());
    }

    #[tokio::test]
    async fn test_server_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let manager = TokenManager::new(test_config(&mock_server.uri())).unwrap();
        let result = manager.acquire().await;

        assert!(matches!(result, Err(TokenError::HttpError(_))));
    }

    #[tokio::test]
    async fn test_invalid_json_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not valid json at all"))
            .mount(&mock_server)
            .await;

        let manager = TokenManager::new(test_config(&mock_server.uri())).unwrap();
        let result = manager.acquire().await;

        assert!(matches!(result, Err(TokenError::InvalidResponse(_))));
    }

    // =========================================================================
    // fresh() caching behavior
    // =========================================================================

    #[tokio::test]
    async fn test_fresh_reuses_valid_credential() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "long-lived",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let manager = TokenManager::new(test_config(&mock_server.uri())).unwrap();
        let first = manager.fresh().await.unwrap();
        let second = manager.fresh().await.unwrap();

        assert_eq!(first.bearer(), second.bearer());
        mock_server.verify().await;
    }

    #[tokio::test]
    async fn test_fresh_refreshes_expired_credential() {
        let mock_server = MockServer::start().await;

        // expires_in 0 means every acquired credential is instantly stale
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "instantly-stale",
                "token_type": "Bearer",
                "expires_in": 0
            })))
            .expect(2)
            .mount(&mock_server)
            .await;

        let manager = TokenManager::new(test_config(&mock_server.uri())).unwrap();
        manager.fresh().await.unwrap();
        manager.fresh().await.unwrap();

        mock_server.verify().await;
    }

    #[tokio::test]
    async fn test_acquire_always_exchanges() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "still-valid",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(2)
            .mount(&mock_server)
            .await;

        let manager = TokenManager::new(test_config(&mock_server.uri())).unwrap();
        manager.acquire().await.unwrap();
        // A second acquire must hit the endpoint even though the current
        // credential is nowhere near expiry (401-retry path relies on this).
        manager.acquire().await.unwrap();

        mock_server.verify().await;
    }

    // =========================================================================
    // Error type tests
    // =========================================================================

    #[test]
    fn test_token_error_display() {
        let err = TokenError::HttpError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));

        let err = TokenError::AuthenticationRejected("Status 401".to_string());
        assert!(err.to_string().contains("Status 401"));

        let err = TokenError::InvalidResponse("invalid json".to_string());
        assert!(err.to_string().contains("invalid json"));

        let err = TokenError::Configuration("bad config".to_string());
        assert!(err.to_string().contains("bad config"));
    }

    #[test]
    fn test_oauth_response_debug_redacts_token() {
        let response = OAuthTokenResponse {
            access_token: "super-secret-access-token".to_string(),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(3600),
        };

        let debug_str = format!("{response:?}");
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("super-secret-access-token"));
        assert!(debug_str.contains("3600"));
    }
}
