//! Client side of the realtime channel.
//!
//! Keeps one WebSocket open to `/realtime`, reconnecting with capped
//! exponential backoff, and forwards what it sees as [`RealtimeEvent`]s.
//! Pokes carry no data; reacting to one is the caller's job.

use futures_util::StreamExt;
use std::time::Duration;
use t8d_api::RealtimeFrame;
use t8d_core::{T8dError, T8dResult};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, info, warn};

pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// Handshake done; the server assigned this session id.
    Connected { session_id: String },
    Poke,
    Disconnected { reason: String },
}

#[derive(Debug, Clone)]
pub struct RealtimeListener {
    url: String,
    token: String,
    min_delay: Duration,
    max_delay: Duration,
}

enum Ended {
    Shutdown,
    Lost(String),
}

impl RealtimeListener {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            min_delay: MIN_RECONNECT_DELAY,
            max_delay: MAX_RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay.max(min_delay);
        self
    }

    /// Runs until `shutdown` flips to true or the event receiver is dropped.
    pub async fn run(self, events: mpsc::Sender<RealtimeEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut delay = self.min_delay;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let reason = match self.session(&events, &mut shutdown).await {
                Ok(Ended::Shutdown) => return,
                Ok(Ended::Lost(reason)) => {
                    delay = self.min_delay;
                    reason
                }
                Err(error) => error.message,
            };

            if events
                .send(RealtimeEvent::Disconnected {
                    reason: reason.clone(),
                })
                .await
                .is_err()
            {
                return;
            }

            debug!(delay_ms = delay.as_millis() as u64, %reason, "realtime reconnect scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            delay = next_delay(delay, self.max_delay);
        }
    }

    /// One connection, from handshake to close. `Err` means it never got as
    /// far as a session id.
    async fn session(
        &self,
        events: &mpsc::Sender<RealtimeEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> T8dResult<Ended> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| T8dError::usage(format!("invalid realtime URL '{}': {err}", self.url)))?;
        let header = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| T8dError::auth("bearer token is not a valid header value"))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| T8dError::sync("realtime connect timed out"))?
            .map_err(|err| T8dError::sync(format!("realtime connect failed: {err}")))?;

        let (_write, mut read) = stream.split();
        let mut connected = false;

        loop {
            let message = tokio::select! {
                message = read.next() => message,
                _ = shutdown.changed() => return Ok(Ended::Shutdown),
            };

            let text = match message {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    return lost(connected, "server closed the connection");
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return lost(connected, &format!("realtime stream error: {err}")),
            };

            let frame = match serde_json::from_str::<RealtimeFrame>(&text) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "ignoring unrecognized realtime frame");
                    continue;
                }
            };

            let event = match frame {
                RealtimeFrame::Session { session_id } => {
                    info!(%session_id, "realtime connected");
                    connected = true;
                    RealtimeEvent::Connected { session_id }
                }
                RealtimeFrame::Poke => RealtimeEvent::Poke,
            };

            if events.send(event).await.is_err() {
                return Ok(Ended::Shutdown);
            }
        }
    }
}

fn lost(connected: bool, reason: &str) -> T8dResult<Ended> {
    if connected {
        Ok(Ended::Lost(reason.to_string()))
    } else {
        Err(T8dError::sync(reason.to_string()))
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
