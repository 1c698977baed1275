//! WebSocket transport channel with reconnect and keep-alive
//!
//! # State machine
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Connected
//!      ▲                        │                    │
//!      │  retries exhausted     │ error              │ close (unintentional)
//!      │                        ▼                    ▼
//!      └─────────────────── Reconnecting <───────────┘
//!                               │ backoff timer
//!                               └──────────▶ Connecting (loop)
//! ```
//!
//! An intentional `disconnect()` short-circuits straight to Disconnected
//! and suppresses the reconnection path. A missing Pong is deliberately
//! not a failure signal; only transport-level close/error events drive
//! reconnection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::protocol::{InboundMessage, OutboundMessage};
use super::TransportError;
use crate::events::{ClientEvent, EventChannel};

/// Timeout for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keep-alive ping cadence while Connected.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound queue depth. Sends are fire-and-forget; a full queue fails the
/// send rather than applying backpressure.
const OUTBOUND_QUEUE: usize = 100;

/// Connection lifecycle, owned exclusively by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Reconnect backoff: attempt `n` (1-indexed) waits
/// `base_delay * backoff_factor^(n-1)`. The retry counter resets on every
/// successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_attempts: 3,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .mul_f64(self.backoff_factor.powi(attempt.saturating_sub(1) as i32))
    }
}

struct Inner {
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    intentional: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap() = next;
    }
}

/// Owns one persistent connection to the transcription service.
pub struct TransportChannel {
    events: Arc<EventChannel>,
    policy: ReconnectPolicy,
    inner: Arc<Inner>,
}

impl TransportChannel {
    pub fn new(events: Arc<EventChannel>) -> Self {
        Self::with_policy(events, ReconnectPolicy::default())
    }

    pub fn with_policy(events: Arc<EventChannel>, policy: ReconnectPolicy) -> Self {
        Self {
            events,
            policy,
            inner: Arc::new(Inner {
                state: Mutex::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                intentional: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    /// Establish the persistent connection. Idempotent while an attempt is
    /// already active; completion and failures surface as events
    /// (`connected`, `reconnecting`, `error`). Must be called from within
    /// a tokio runtime.
    pub fn connect(&self, endpoint: &str) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != ConnectionState::Disconnected {
                log::debug!("connect() ignored in state {:?}", *state);
                return;
            }
            *state = ConnectionState::Connecting;
        }

        self.inner.intentional.store(false, Ordering::SeqCst);
        let token = CancellationToken::new();
        *self.inner.shutdown.lock().unwrap() = Some(token.clone());

        let inner = self.inner.clone();
        let events = self.events.clone();
        let policy = self.policy.clone();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            run_connection(inner, events, policy, endpoint, token).await;
        });
    }

    /// Serialize and transmit one message, at-most-once. Ordering is
    /// preserved because a single writer task drains the outbound queue.
    pub fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let json = serde_json::to_string(message)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let guard = self.inner.outbound.lock().unwrap();
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.try_send(Message::Text(json))
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Intentional close. Sets Disconnected and suppresses reconnection,
    /// distinguishing "user closed" from "network dropped".
    pub fn disconnect(&self) {
        self.inner.intentional.store(true, Ordering::SeqCst);
        if let Some(token) = self.inner.shutdown.lock().unwrap().take() {
            token.cancel();
        }
        let previous = {
            let mut state = self.inner.state.lock().unwrap();
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };
        self.inner.outbound.lock().unwrap().take();

        if previous != ConnectionState::Disconnected {
            self.events.emit(ClientEvent::Disconnected {
                reason: "client closed".to_string(),
            });
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(token) = self.inner.shutdown.lock().unwrap().take() {
            token.cancel();
        }
    }
}

async fn run_connection(
    inner: Arc<Inner>,
    events: Arc<EventChannel>,
    policy: ReconnectPolicy,
    endpoint: String,
    token: CancellationToken,
) {
    let mut retries: u32 = 0;

    loop {
        inner.set_state(ConnectionState::Connecting);

        match timeout(CONNECT_TIMEOUT, connect_async(endpoint.as_str())).await {
            Ok(Ok((ws, _response))) => {
                retries = 0;
                inner.set_state(ConnectionState::Connected);
                log::info!("Connected to {}", endpoint);
                events.emit(ClientEvent::Connected);

                serve_connection(ws, &inner, &events, &token).await;

                if token.is_cancelled() || inner.intentional.load(Ordering::SeqCst) {
                    // disconnect() already set the state and emitted.
                    return;
                }
                log::warn!("Connection to {} dropped", endpoint);
            }
            Ok(Err(e)) => log::warn!("Connect to {} failed: {}", endpoint, e),
            Err(_) => log::warn!("Connect to {} timed out", endpoint),
        }

        if token.is_cancelled() {
            inner.set_state(ConnectionState::Disconnected);
            return;
        }

        retries += 1;
        if retries > policy.max_attempts {
            inner.set_state(ConnectionState::Disconnected);
            events.emit(ClientEvent::Error {
                message: TransportError::ReconnectExhausted.to_string(),
            });
            events.emit(ClientEvent::Disconnected {
                reason: "reconnect exhausted".to_string(),
            });
            return;
        }

        let delay = policy.delay_for(retries);
        inner.set_state(ConnectionState::Reconnecting);
        events.emit(ClientEvent::Reconnecting {
            attempt: retries,
            delay_ms: delay.as_millis() as u64,
        });
        log::info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            endpoint,
            delay,
            retries,
            policy.max_attempts
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
        }
    }
}

/// Drive one open connection: writer task, keep-alive pings, and the
/// inbound read loop. Returns when the socket closes or shutdown fires.
async fn serve_connection(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    inner: &Arc<Inner>,
    events: &Arc<EventChannel>,
    token: &CancellationToken,
) {
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    *inner.outbound.lock().unwrap() = Some(tx.clone());

    // Single writer preserves per-sender ordering.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.send(frame).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    // Keep-alive pings go through the same queue as ordinary sends.
    let ping_tx = tx.clone();
    let keepalive = tokio::spawn(async move {
        let mut tick = tokio::time::interval(PING_INTERVAL);
        tick.tick().await; // the first tick completes immediately
        loop {
            tick.tick().await;
            let json = match serde_json::to_string(&OutboundMessage::ping()) {
                Ok(json) => json,
                Err(_) => continue,
            };
            if ping_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch_inbound(&text, events),
                Some(Ok(Message::Close(_))) => {
                    log::info!("Server closed the connection");
                    break;
                }
                Some(Ok(_)) => {} // binary/ping/pong frames are not part of the contract
                Some(Err(e)) => {
                    log::warn!("WebSocket error: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    keepalive.abort();
    inner.outbound.lock().unwrap().take();
    drop(tx);
    let _ = writer.await;
}

/// Decode one inbound frame and re-emit it as a typed event. Decode
/// failures and unknown discriminants are reported but never terminate
/// the connection.
fn dispatch_inbound(text: &str, events: &Arc<EventChannel>) {
    match serde_json::from_str::<InboundMessage>(text) {
        Ok(InboundMessage::Connection { client_id, .. }) => {
            log::debug!("Server hello (client_id: {:?})", client_id);
        }
        Ok(InboundMessage::Config {
            status,
            model,
            language,
        }) => {
            log::info!("Server config ack: status={:?} model={:?}", status, model);
            events.emit(ClientEvent::ConfigAck {
                model: model.unwrap_or_default(),
                language,
            });
        }
        Ok(msg @ InboundMessage::Transcription { .. }) => {
            if let Some(result) = msg.to_result() {
                events.emit(ClientEvent::Transcription(result));
            }
        }
        Ok(InboundMessage::Error { message }) => {
            log::warn!("Server error: {}", message);
            events.emit(ClientEvent::ServerError { message });
        }
        Ok(InboundMessage::Pong { .. }) => events.emit(ClientEvent::Pong),
        Ok(InboundMessage::Unknown) => {
            log::debug!("Ignoring unknown message type");
            events.emit(ClientEvent::UnknownMessage);
        }
        Err(e) => {
            log::warn!("Failed to decode server message: {}", e);
            events.emit(ClientEvent::Error {
                message: TransportError::MessageDecodeError(e.to_string()).to_string(),
            });
        }
    }
}
