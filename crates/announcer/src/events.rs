//! Call-control event subscription loop.
//!
//! Maintains the persistent WebSocket connection to the PBX event feed as an
//! explicit state machine: `Disconnected → Connecting → Subscribed`, back to
//! `Disconnected` on any close or error, with a flat reconnect delay and no
//! retry cap. The loop is designed to run for the lifetime of the process;
//! the external shutdown token is the only terminal path.
//!
//! Inbound messages are processed in arrival order on the loop's own task so
//! the per-connection status history stays consistent. Announcements run on
//! spawned tasks and never block event processing.

use crate::api::CallControlClient;
use crate::errors::AnnouncerError;
use crate::media::{AnnouncementStreamer, MediaSource};
use common::token_manager::TokenManager;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Event type signaling an entity update on the feed.
const EVENT_TYPE_UPSERT: i64 = 0;

/// Participant status that triggers an announcement.
const STATUS_CONNECTED: &str = "Connected";

/// Path subscribed to on the event feed.
const SUBSCRIBE_PATH: &str = "/callcontrol";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subscribe directive sent right after the connection opens.
#[derive(Serialize)]
struct SubscribeDirective {
    action: &'static str,
    path: &'static str,
}

/// Envelope of every inbound feed message.
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    pub event: EventBody,
}

#[derive(Debug, Deserialize)]
pub struct EventBody {
    pub event_type: i64,
    pub entity: String,
}

/// Participant reference extracted from an entity path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRef {
    /// Participant identifier (the path segment after `participants`).
    pub id: String,
    /// Full entity path, used as-is for the status lookup.
    pub entity: String,
}

/// Extract a [`ParticipantRef`] from an entity path such as
/// `/callcontrol/111/participants/42`.
///
/// Returns `None` when the path carries no `participants` segment or no
/// identifier after it.
#[must_use]
pub fn participant_ref(entity: &str) -> Option<ParticipantRef> {
    let mut segments = entity.split('/');
    segments.find(|segment| *segment == "participants")?;
    let id = segments.next()?;
    if id.is_empty() {
        return None;
    }
    Some(ParticipantRef {
        id: id.to_string(),
        entity: entity.to_string(),
    })
}

/// Connection state of the subscription loop.
enum ConnectionState {
    /// Not connected; `reconnect` selects whether the delay applies.
    Disconnected { reconnect: bool },
    /// Opening the connection and sending the subscribe directive.
    Connecting,
    /// Connected and subscribed; driving inbound messages.
    Subscribed(Box<WsStream>),
}

/// The persistent event subscription loop.
pub struct SubscriptionLoop {
    ws_url: String,
    reconnect_delay: Duration,
    tokens: Arc<TokenManager>,
    client: Arc<CallControlClient>,
    streamer: Arc<AnnouncementStreamer>,
    media: MediaSource,
    shutdown: CancellationToken,
}

impl SubscriptionLoop {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ws_url: String,
        reconnect_delay: Duration,
        tokens: Arc<TokenManager>,
        client: Arc<CallControlClient>,
        streamer: Arc<AnnouncementStreamer>,
        media: MediaSource,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ws_url,
            reconnect_delay,
            tokens,
            client,
            streamer,
            media,
            shutdown,
        }
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// Reconnection is unconditional and unbounded: there is no backoff
    /// growth and no maximum retry count.
    pub async fn run(self) {
        let mut state = ConnectionState::Disconnected { reconnect: false };

        loop {
            state = match state {
                ConnectionState::Disconnected { reconnect } => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    if reconnect {
                        debug!(
                            target: "announcer.events",
                            delay_ms = self.reconnect_delay.as_millis(),
                            "Reconnecting after delay"
                        );
                        tokio::select! {
                            () = self.shutdown.cancelled() => break,
                            () = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                    ConnectionState::Connecting
                }
                ConnectionState::Connecting => match self.connect_and_subscribe().await {
                    Ok(socket) => ConnectionState::Subscribed(Box::new(socket)),
                    Err(e) => {
                        warn!(
                            target: "announcer.events",
                            error = %e,
                            "Event connection failed"
                        );
                        ConnectionState::Disconnected { reconnect: true }
                    }
                },
                ConnectionState::Subscribed(socket) => {
                    // The status history lives inside drive(): it belongs to
                    // one connection and dies with it.
                    self.drive(*socket).await;
                    ConnectionState::Disconnected { reconnect: true }
                }
            };
        }

        info!(target: "announcer.events", "Subscription loop stopped");
    }

    /// Open the event connection with a fresh credential and subscribe.
    async fn connect_and_subscribe(&self) -> Result<WsStream, AnnouncerError> {
        let credential = self.tokens.fresh().await?;

        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| AnnouncerError::Request(format!("invalid event feed URL: {e}")))?;
        let bearer = HeaderValue::from_str(&credential.bearer())
            .map_err(|e| AnnouncerError::Request(format!("invalid authorization header: {e}")))?;
        request.headers_mut().insert("Authorization", bearer);

        debug!(target: "announcer.events", url = %self.ws_url, "Opening event connection");

        let (mut socket, _response) = connect_async(request)
            .await
            .map_err(|e| AnnouncerError::Request(format!("event connection failed: {e}")))?;

        let directive = serde_json::to_string(&SubscribeDirective {
            action: "subscribe",
            path: SUBSCRIBE_PATH,
        })
        .map_err(|e| AnnouncerError::Parse(e.to_string()))?;

        socket
            .send(Message::Text(directive))
            .await
            .map_err(|e| AnnouncerError::Request(format!("subscribe directive failed: {e}")))?;

        info!(
            target: "announcer.events",
            path = SUBSCRIBE_PATH,
            "Subscribed to call-control events"
        );

        Ok(socket)
    }

    /// Drive one subscribed connection until it closes or shutdown fires.
    async fn drive(&self, mut socket: WsStream) {
        let mut history: HashMap<String, String> = HashMap::new();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    let _ = socket.close(None).await;
                    info!(target: "announcer.events", "Event connection closed for shutdown");
                    return;
                }
                message = socket.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_message(&text, &mut history).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(
                            target: "announcer.events",
                            frame = ?frame,
                            "Event connection closed by server"
                        );
                        return;
                    }
                    Some(Ok(_)) => {} // ping/pong/binary keepalives
                    Some(Err(e)) => {
                        warn!(target: "announcer.events", error = %e, "Event connection error");
                        return;
                    }
                    None => {
                        info!(target: "announcer.events", "Event stream ended");
                        return;
                    }
                }
            }
        }
    }

    /// Handle one inbound feed message.
    ///
    /// Every failure in here is local to this message: it is logged, the
    /// message (or event) is dropped, and the connection stays subscribed.
    async fn handle_message(&self, text: &str, history: &mut HashMap<String, String>) {
        let envelope: EventEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    target: "announcer.events",
                    error = %e,
                    "Discarding unparseable event message"
                );
                return;
            }
        };

        if envelope.event.event_type != EVENT_TYPE_UPSERT {
            trace!(
                target: "announcer.events",
                event_type = envelope.event.event_type,
                "Ignoring event type"
            );
            return;
        }

        let Some(participant) = participant_ref(&envelope.event.entity) else {
            trace!(
                target: "announcer.events",
                entity = %envelope.event.entity,
                "Event does not reference a participant"
            );
            return;
        };

        let snapshot = match self.client.participant_status(&participant.entity).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    target: "announcer.events",
                    participant_id = %participant.id,
                    error = %e,
                    "Dropping event after failed participant lookup"
                );
                return;
            }
        };

        let previous = history.insert(participant.id.clone(), snapshot.status.clone());
        if snapshot.status == STATUS_CONNECTED && previous.as_deref() != Some(STATUS_CONNECTED) {
            info!(
                target: "announcer.events",
                participant_id = %participant.id,
                caller = ?snapshot.party_caller_name,
                "Participant newly connected"
            );
            self.start_announcement(participant).await;
        } else {
            debug!(
                target: "announcer.events",
                participant_id = %participant.id,
                status = %snapshot.status,
                previous = ?previous,
                "No action for participant status"
            );
        }
    }

    /// Start one announcement upload on its own task.
    ///
    /// At most one attempt per qualifying event; failures are logged and
    /// abandoned without retry.
    async fn start_announcement(&self, participant: ParticipantRef) {
        if let Err(e) = self.media.verify() {
            warn!(
                target: "announcer.events",
                error = %e,
                "Skipping announcement, media asset unavailable"
            );
            return;
        }

        let source = match self.media.open().await {
            Ok(source) => source,
            Err(e) => {
                warn!(
                    target: "announcer.events",
                    error = %e,
                    "Skipping announcement, media asset unreadable"
                );
                return;
            }
        };

        let credential = match self.tokens.fresh().await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(
                    target: "announcer.events",
                    error = %e,
                    "Skipping announcement, no valid credential"
                );
                return;
            }
        };

        let streamer = Arc::clone(&self.streamer);
        let cancel = self.shutdown.child_token();
        let participant_id = participant.id;

        tokio::spawn(async move {
            match streamer
                .stream(&participant_id, source, &credential, &cancel)
                .await
            {
                Ok(()) => info!(
                    target: "announcer.events",
                    participant_id = %participant_id,
                    "Announcement finished"
                ),
                Err(e) if e.is_cancellation() => info!(
                    target: "announcer.events",
                    participant_id = %participant_id,
                    "Announcement cancelled"
                ),
                Err(e) => warn!(
                    target: "announcer.events",
                    participant_id = %participant_id,
                    error = %e,
                    "Announcement failed"
                ),
            }
        });
    }
}
