//! Media source and announcement upload streaming.
//!
//! [`MediaSource`] owns the local WAV asset: existence verification and
//! sequential chunk production. [`AnnouncementStreamer`] pipes those chunks
//! into the participant stream endpoint over a single chunked POST.
//!
//! An upload is one attempt: transport failures and cancellation abandon the
//! connection without retry, and neither is allowed to escalate beyond the
//! upload that hit it.

use crate::errors::AnnouncerError;
use bytes::Bytes;
use common::token_manager::Credential;
use futures_util::TryStream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection timeout for the upload endpoint.
///
/// The upload itself carries no overall timeout: it lives as long as the
/// audio takes to play out.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The local audio asset streamed to connected participants.
#[derive(Debug, Clone)]
pub struct MediaSource {
    path: PathBuf,
}

impl MediaSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check that the asset exists and is a regular file.
    ///
    /// Runs at startup (process-fatal) and again before each stream attempt.
    ///
    /// # Errors
    ///
    /// Returns `AnnouncerError::Media` if the asset is missing or not a file.
    pub fn verify(&self) -> Result<(), AnnouncerError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(AnnouncerError::Media(format!(
                "audio asset is not a regular file: {}",
                self.path.display()
            ))),
            Err(e) => Err(AnnouncerError::Media(format!(
                "audio asset unavailable at {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Open the asset as a back-pressured chunk stream.
    ///
    /// # Errors
    ///
    /// Returns `AnnouncerError::Media` if the file cannot be opened.
    pub async fn open(&self) -> Result<ReaderStream<tokio::fs::File>, AnnouncerError> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            AnnouncerError::Media(format!(
                "failed to open audio asset {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(ReaderStream::new(file))
    }
}

/// Streams announcement audio to participants over chunked POST uploads.
pub struct AnnouncementStreamer {
    http: reqwest::Client,
    base_url: String,
    extension: String,
}

impl AnnouncementStreamer {
    /// Create a streamer for the given PBX and source extension.
    ///
    /// # Errors
    ///
    /// Returns `AnnouncerError::Config` if the HTTP client cannot be built.
    pub fn new(base_url: String, extension: String) -> Result<Self, AnnouncerError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AnnouncerError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            extension,
        })
    }

    /// Stream `source` to the participant's stream endpoint.
    ///
    /// The body is wrapped as a streamed request with no pre-declared length,
    /// so the transfer is chunked and chunks are forwarded as the source
    /// produces them — the asset is never buffered whole. The server's
    /// response is observed for diagnostics only; it does not change the
    /// streaming outcome already decided.
    ///
    /// # Errors
    ///
    /// - `AnnouncerError::StreamCancelled` when `cancel` fires mid-upload;
    ///   the in-flight request is dropped, which aborts the connection and
    ///   stops byte-source reads. Partial writes are not rolled back.
    /// - `AnnouncerError::Stream` on a transport-level failure.
    pub async fn stream<S>(
        &self,
        participant_id: &str,
        source: S,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<(), AnnouncerError>
    where
        S: TryStream + Send + 'static,
        S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        Bytes: From<S::Ok>,
    {
        let url = format!(
            "{}/callcontrol/{}/participants/{}/stream",
            self.base_url, self.extension, participant_id
        );

        info!(
            target: "announcer.media",
            participant_id = %participant_id,
            "Starting announcement upload"
        );

        let request = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(AUTHORIZATION, credential.bearer())
            .body(reqwest::Body::wrap_stream(source))
            .send();

        tokio::select! {
            () = cancel.cancelled() => {
                warn!(
                    target: "announcer.media",
                    participant_id = %participant_id,
                    "Upload cancelled, aborting connection"
                );
                Err(AnnouncerError::StreamCancelled)
            }
            result = request => match result {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    debug!(
                        target: "announcer.media",
                        participant_id = %participant_id,
                        status = %status,
                        body = %body,
                        "Upload response observed"
                    );
                    Ok(())
                }
                Err(e) => {
                    warn!(
                        target: "announcer.media",
                        participant_id = %participant_id,
                        error = %e,
                        "Upload transport failure, aborting"
                    );
                    Err(AnnouncerError::Stream(e.to_string()))
                }
            }
        }
    }
}

impl std::fmt::Debug for AnnouncementStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnouncementStreamer")
            .field("base_url", &self.base_url)
            .field("extension", &self.extension)
            .finish_non_exhaustive()
    }
}
