//! Call-control HTTP client.
//!
//! Wraps every outbound call with the credential lifecycle: a non-expired
//! credential is fetched (refreshing if needed) before the request goes out,
//! and a 401 response triggers exactly one re-acquisition and one retry.
//! A second 401 surfaces as an authentication error; any other failure is a
//! plain request error with no retry.

use crate::errors::AnnouncerError;
use common::token_manager::TokenManager;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for unary call-control requests.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Participant state as returned by the participant resource.
#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantSnapshot {
    pub id: i64,
    pub status: String,
    #[serde(default)]
    pub party_caller_name: Option<String>,
    #[serde(default)]
    pub party_dn: Option<String>,
    #[serde(default)]
    pub callid: Option<i64>,
}

/// Body for the call initiation endpoint.
#[derive(Debug, Serialize)]
struct MakeCallRequest<'a> {
    destination: &'a str,
}

/// Response from the call initiation endpoint.
#[derive(Debug, Deserialize)]
struct MakeCallResponse {
    #[serde(rename = "participantId")]
    participant_id: i64,
}

/// Authenticated client for the call-control API.
pub struct CallControlClient {
    http: reqwest::Client,
    base_url: String,
    extension: String,
    tokens: Arc<TokenManager>,
}

impl CallControlClient {
    /// Create a client for the given PBX and source extension.
    ///
    /// # Errors
    ///
    /// Returns `AnnouncerError::Config` if the HTTP client cannot be built.
    pub fn new(
        base_url: String,
        extension: String,
        tokens: Arc<TokenManager>,
    ) -> Result<Self, AnnouncerError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AnnouncerError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            extension,
            tokens,
        })
    }

    /// Issue a request with the current credential, refreshing once and
    /// retrying once on 401.
    ///
    /// The retry policy is strictly scoped to authorization failures: any
    /// other error status or transport failure surfaces immediately.
    async fn send_authorized<F>(&self, build: F) -> Result<reqwest::Response, AnnouncerError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let credential = self.tokens.fresh().await?;

        let response = build(&self.http)
            .header(AUTHORIZATION, credential.bearer())
            .send()
            .await
            .map_err(|e| AnnouncerError::Request(e.to_string()))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::check_status(response);
        }

        warn!(
            target: "announcer.api",
            "Request unauthorized, re-acquiring credential and retrying once"
        );

        let credential = self.tokens.acquire().await?;

        let response = build(&self.http)
            .header(AUTHORIZATION, credential.bearer())
            .send()
            .await
            .map_err(|e| AnnouncerError::Request(e.to_string()))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(AnnouncerError::Auth(
                "request unauthorized after credential refresh".to_string(),
            ));
        }

        Self::check_status(response)
    }

    /// Map non-success statuses to `Request` errors.
    fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AnnouncerError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(AnnouncerError::Request(format!(
                "unexpected status: {status}"
            )))
        }
    }

    /// Fetch the current state of the participant at `entity` (the full
    /// entity path from an event, e.g. `/callcontrol/111/participants/42`).
    ///
    /// # Errors
    ///
    /// Any failure is surfaced as `AnnouncerError::Lookup`; callers drop the
    /// triggering event and carry on.
    pub async fn participant_status(
        &self,
        entity: &str,
    ) -> Result<ParticipantSnapshot, AnnouncerError> {
        let url = format!("{}{}", self.base_url, entity);

        let response = self
            .send_authorized(|http| http.get(&url))
            .await
            .map_err(|e| AnnouncerError::Lookup(e.to_string()))?;

        let snapshot: ParticipantSnapshot = response
            .json()
            .await
            .map_err(|e| AnnouncerError::Lookup(format!("invalid participant response: {e}")))?;

        debug!(
            target: "announcer.api",
            participant_id = snapshot.id,
            status = %snapshot.status,
            "Participant status fetched"
        );

        Ok(snapshot)
    }

    /// Place an outbound call from the configured extension.
    ///
    /// Returns the participant identifier of the new call leg.
    ///
    /// # Errors
    ///
    /// Returns `AnnouncerError::Auth` on unrecoverable authorization failure
    /// and `AnnouncerError::Request` on any other failure.
    pub async fn make_call(&self, destination: &str) -> Result<i64, AnnouncerError> {
        let url = format!("{}/callcontrol/{}/makecall", self.base_url, self.extension);
        let body = MakeCallRequest { destination };

        let response = self.send_authorized(|http| http.post(&url).json(&body)).await?;

        let call: MakeCallResponse = response
            .json()
            .await
            .map_err(|e| AnnouncerError::Request(format!("invalid makecall response: {e}")))?;

        debug!(
            target: "announcer.api",
            participant_id = call.participant_id,
            destination = %destination,
            "Outbound call placed"
        );

        Ok(call.participant_id)
    }
}

impl std::fmt::Debug for CallControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallControlClient")
            .field("base_url", &self.base_url)
            .field("extension", &self.extension)
            .finish_non_exhaustive()
    }
}
