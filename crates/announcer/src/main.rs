//! Announcer
//!
//! Streams a pre-recorded WAV announcement to PBX call participants as they
//! connect.
//!
//! # Startup Flow
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment
//! 3. Verify the audio asset exists (before any network call)
//! 4. Acquire the initial OAuth token
//! 5. Optionally place the configured outbound call
//! 6. Run the event subscription loop
//! 7. Wait for shutdown signal; cancellation propagates to in-flight uploads

#![warn(clippy::pedantic)]

use announcer::config::Config;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for in-flight work after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "announcer=info,common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting announcer");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        base_url = %config.base_url,
        extension = %config.extension,
        audio_path = %config.audio_path,
        reconnect_delay_seconds = config.reconnect_delay_seconds,
        "Configuration loaded successfully"
    );

    let shutdown = CancellationToken::new();
    let mut app = tokio::spawn(announcer::run(config, shutdown.clone()));

    tokio::select! {
        // run() only returns on its own for startup failures
        result = &mut app => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "Announcer failed to start");
                Err(e.into())
            }
            Err(e) => {
                error!(error = %e, "Announcer task failed");
                Err(e.into())
            }
        },
        () = shutdown_signal() => {
            // Cancellation propagates to any in-flight announcement upload
            info!("Shutdown signal received, cancelling in-flight work...");
            shutdown.cancel();

            match tokio::time::timeout(SHUTDOWN_GRACE, app).await {
                Ok(Ok(Ok(()))) => info!("Announcer shutdown complete"),
                Ok(Ok(Err(e))) => warn!(error = %e, "Announcer exited with error during shutdown"),
                Ok(Err(e)) => warn!(error = %e, "Announcer task join error during shutdown"),
                Err(_) => warn!("Announcer did not stop within the grace period"),
            }
            Ok(())
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
