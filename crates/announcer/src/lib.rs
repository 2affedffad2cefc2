//! PBX announcement streamer.
//!
//! Watches the PBX call-control event feed and streams a pre-recorded WAV
//! announcement to every call participant whose status transitions to
//! "Connected". One workflow, one resilience contract: the event feed
//! reconnects forever, expired tokens are refreshed transparently, and a
//! request that comes back unauthorized is retried exactly once with a fresh
//! credential.

#![warn(clippy::pedantic)]

/// Module for the authenticated call-control HTTP client
pub mod api;

/// Module for environment-variable configuration
pub mod config;

/// Module for the announcer error taxonomy
pub mod errors;

/// Module for the event subscription loop
pub mod events;

/// Module for the media source and upload streamer
pub mod media;

use crate::api::CallControlClient;
use crate::config::Config;
use crate::errors::AnnouncerError;
use crate::events::SubscriptionLoop;
use crate::media::{AnnouncementStreamer, MediaSource};
use common::token_manager::{TokenManager, TokenManagerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run the announcer until `shutdown` is cancelled.
///
/// Startup order is part of the contract: the media asset is verified before
/// any network call is made, and the initial token acquisition must succeed
/// before the event loop starts. Either failure is returned to the caller
/// (and is process-fatal in `main`); after startup the subscription loop
/// runs for the lifetime of the process.
///
/// # Errors
///
/// Returns `AnnouncerError::Media` if the audio asset is unavailable,
/// `AnnouncerError::Auth` if the initial token acquisition fails, and
/// `AnnouncerError::Config` if a client cannot be constructed.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), AnnouncerError> {
    let media = MediaSource::new(&config.audio_path);
    media.verify()?;
    info!(
        target: "announcer",
        path = %media.path().display(),
        "Audio asset located"
    );

    let tokens = Arc::new(TokenManager::new(TokenManagerConfig::new(
        config.base_url.clone(),
        config.client_id.clone(),
        config.client_secret.clone(),
    ))?);
    tokens.acquire().await?;
    info!(target: "announcer", "Initial token acquired");

    let client = Arc::new(CallControlClient::new(
        config.base_url.clone(),
        config.extension.clone(),
        Arc::clone(&tokens),
    )?);

    // Supporting operation: place the outbound call whose participants the
    // pipeline then announces to. Failure is logged, not fatal.
    if let Some(destination) = &config.dial_destination {
        match client.make_call(destination).await {
            Ok(participant_id) => info!(
                target: "announcer",
                participant_id,
                destination = %destination,
                "Outbound call placed"
            ),
            Err(e) => warn!(
                target: "announcer",
                error = %e,
                destination = %destination,
                "Outbound call failed"
            ),
        }
    }

    let streamer = Arc::new(AnnouncementStreamer::new(
        config.base_url.clone(),
        config.extension.clone(),
    )?);

    let subscription = SubscriptionLoop::new(
        config.events_url(),
        Duration::from_secs(config.reconnect_delay_seconds),
        tokens,
        client,
        streamer,
        media,
        shutdown,
    );
    subscription.run().await;

    Ok(())
}
