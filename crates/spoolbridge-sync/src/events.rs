//! # Inventory Event Listener
//!
//! WebSocket client for the Inventory's push feed, with automatic
//! reconnection and backoff.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Event Stream States                                  │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │  Backoff   │                   │
//! │        │              └─────┬──────┘  └─────┬──────┘                   │
//! │        │       error / idle │               │ timer expired             │
//! │        └────────────────────┴───────────────┘                           │
//! │                                                                         │
//! │  BACKOFF: exponential with full jitter, 1s base, ×2, 60s cap           │
//! │  IDLE: no frame for 60s ⇒ connection considered dead ⇒ reconnect       │
//! │                                                                         │
//! │  Events arriving while disconnected are LOST; every successful          │
//! │  (re)connect therefore emits a Connected signal so the engine can       │
//! │  run a full reconciliation sweep.                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::inventory::Spool;

// =============================================================================
// Events
// =============================================================================

/// A spool lifecycle event pushed by the Inventory.
#[derive(Debug, Clone, PartialEq)]
pub enum SpoolEvent {
    Created(Spool),
    Updated(Spool),
    Deleted(Spool),
}

impl SpoolEvent {
    /// The Inventory spool id this event concerns.
    pub fn spool_id(&self) -> i64 {
        match self {
            SpoolEvent::Created(s) | SpoolEvent::Updated(s) | SpoolEvent::Deleted(s) => s.id,
        }
    }
}

/// What the listener delivers to the engine.
#[derive(Debug)]
pub enum ListenerSignal {
    /// The stream (re)connected; events may have been missed while down.
    Connected,

    /// A spool event arrived.
    Event(SpoolEvent),
}

/// JSON envelope of every feed frame.
#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    resource: String,
    payload: serde_json::Value,
}

/// Parses one text frame into a spool event.
///
/// Frames for other resources return `Ok(None)`; structurally broken
/// frames return `Err` so the caller can log them.
fn parse_frame(text: &str) -> SyncResult<Option<SpoolEvent>> {
    let envelope: EventEnvelope = serde_json::from_str(text)?;
    if envelope.resource != "spool" {
        return Ok(None);
    }
    let spool: Spool = serde_json::from_value(envelope.payload)?;
    let event = match envelope.kind.as_str() {
        "added" => SpoolEvent::Created(spool),
        "updated" => SpoolEvent::Updated(spool),
        "deleted" => SpoolEvent::Deleted(spool),
        other => {
            debug!(kind = %other, "Ignoring unknown event kind");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

// =============================================================================
// Listener State & Configuration
// =============================================================================

/// Connection state of the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Disconnected => write!(f, "disconnected"),
            StreamState::Connecting => write!(f, "connecting"),
            StreamState::Connected => write!(f, "connected"),
            StreamState::Backoff => write!(f, "backoff"),
        }
    }
}

/// Configuration for the event listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// WebSocket URL of the spool feed.
    pub url: String,

    /// Connection handshake timeout.
    pub connect_timeout: Duration,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Read idle timeout after which the connection is considered dead.
    pub idle_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Listener Handle
// =============================================================================

/// Handle for observing and stopping a running listener.
#[derive(Clone)]
pub struct EventListenerHandle {
    state: Arc<RwLock<StreamState>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl EventListenerHandle {
    /// Returns the current stream state.
    pub async fn state(&self) -> StreamState {
        *self.state.read().await
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::Channel("listener shutdown channel closed".into()))
    }
}

// =============================================================================
// Event Listener
// =============================================================================

/// WebSocket listener with automatic reconnection.
pub struct EventListener {
    config: ListenerConfig,
    state: Arc<RwLock<StreamState>>,
    signal_tx: mpsc::Sender<ListenerSignal>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl EventListener {
    /// Creates a listener and spawns its background task.
    ///
    /// Returns a control handle and the signal receiver the engine's event
    /// loop consumes.
    pub fn spawn(config: ListenerConfig) -> (EventListenerHandle, mpsc::Receiver<ListenerSignal>) {
        let (signal_tx, signal_rx) = mpsc::channel(100);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let state = Arc::new(RwLock::new(StreamState::Disconnected));

        let listener = EventListener {
            config,
            state: state.clone(),
            signal_tx,
            shutdown_rx,
        };
        tokio::spawn(listener.run());

        (EventListenerHandle { state, shutdown_tx }, signal_rx)
    }

    /// Main reconnect loop.
    async fn run(mut self) {
        info!(url = %self.config.url, "Event listener starting");
        let mut backoff = self.create_backoff();

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                break;
            }

            *self.state.write().await = StreamState::Connecting;

            match self.connect_with_timeout().await {
                Ok(ws_stream) => {
                    info!("Inventory event stream connected");
                    *self.state.write().await = StreamState::Connected;
                    backoff.reset();

                    if self.signal_tx.send(ListenerSignal::Connected).await.is_err() {
                        break;
                    }
                    if self.read_loop(ws_stream).await.is_break() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to inventory event stream");
                }
            }

            *self.state.write().await = StreamState::Backoff;

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.max_backoff);
            debug!(?delay, "Waiting before event stream reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.recv() => break,
            }
        }

        *self.state.write().await = StreamState::Disconnected;
        info!("Event listener stopped");
    }

    async fn connect_with_timeout(
        &self,
    ) -> SyncResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let connect_future = connect_async(self.config.url.as_str());
        match timeout(self.config.connect_timeout, connect_future).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "Event stream handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Unreachable(format!(
                "event stream connect timed out after {:?}",
                self.config.connect_timeout
            ))),
        }
    }

    /// Reads frames until the connection dies, idles out, or shutdown is
    /// requested. `Break` means stop the listener entirely.
    async fn read_loop(
        &mut self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> std::ops::ControlFlow<()> {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                frame = timeout(self.config.idle_timeout, read.next()) => {
                    match frame {
                        Err(_) => {
                            warn!(
                                idle = ?self.config.idle_timeout,
                                "Event stream idle timeout, reconnecting"
                            );
                            return std::ops::ControlFlow::Continue(());
                        }
                        Ok(None) => {
                            warn!("Event stream ended");
                            return std::ops::ControlFlow::Continue(());
                        }
                        Ok(Some(Err(e))) => {
                            warn!(error = %e, "Event stream read error");
                            return std::ops::ControlFlow::Continue(());
                        }
                        Ok(Some(Ok(WsMessage::Text(text)))) => {
                            match parse_frame(&text) {
                                Ok(Some(event)) => {
                                    debug!(spool_id = event.spool_id(), "Received spool event");
                                    if self.signal_tx.send(ListenerSignal::Event(event)).await.is_err() {
                                        return std::ops::ControlFlow::Break(());
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => debug!(error = %e, "Dropping unparseable event frame"),
                            }
                        }
                        Ok(Some(Ok(WsMessage::Ping(data)))) => {
                            if write.send(WsMessage::Pong(data)).await.is_err() {
                                return std::ops::ControlFlow::Continue(());
                            }
                        }
                        Ok(Some(Ok(WsMessage::Close(frame)))) => {
                            info!(?frame, "Event stream closed by inventory");
                            return std::ops::ControlFlow::Continue(());
                        }
                        Ok(Some(Ok(_))) => {
                            // Pong / binary / raw frames carry nothing for us.
                        }
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return std::ops::ControlFlow::Break(());
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            // Full jitter: each delay is drawn uniformly around the current
            // interval so reconnect storms do not synchronize.
            randomization_factor: 1.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}
