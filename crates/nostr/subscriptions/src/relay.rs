//! One relay socket: lifecycle, sending, inbound frame routing and health.
//!
//! A [`RelayConnection`] owns one transport to one relay. It is single-use:
//! once it reaches `Closed` or `Error` it stays there, and reconnecting means
//! building a replacement (the pool does that). Inbound frames and the
//! unexpected-disconnect notification leave through the `ConnectionEvent`
//! channel handed over at construction, so nothing upstream is touched from
//! the reader task.

use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::message::{ClientMessage, RelayMessage};
use crate::transport::{Connector, Transport, TransportEvent, TransportHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, `connect` not called yet
    Idle,
    /// Handshake in progress
    Connecting,
    /// Socket open, frames flowing
    Open,
    /// Closing at our request
    Closing,
    /// Closed (terminal)
    Closed,
    /// Transport failed (terminal)
    Error,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error)
    }
}

/// Notifications a connection sends upward.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A parsed frame other than OK
    Message {
        relay_url: String,
        message: RelayMessage,
    },
    /// The relay went away without being asked to
    Disconnected { relay_url: String, reason: String },
}

/// A relay's `OK` verdict for a published event.
#[derive(Debug, Clone)]
pub struct PublishConfirmation {
    pub event_id: String,
    pub accepted: bool,
    /// Reason text; usually empty on acceptance
    pub message: String,
}

type ConfirmationSender = oneshot::Sender<PublishConfirmation>;

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound for the WebSocket handshake
    pub connect_timeout: Duration,
    /// How long `publish` waits for the relay's OK
    pub publish_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-connection counters
#[derive(Debug, Clone)]
pub struct RelayHealth {
    pub relay_url: String,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub frames_received: u64,
    pub last_error: Option<String>,
    pub connected_at: Option<Instant>,
}

impl RelayHealth {
    fn new(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            frames_sent: 0,
            send_failures: 0,
            frames_received: 0,
            last_error: None,
            connected_at: None,
        }
    }

    /// Share of sends that went through, 1.0 when nothing was sent yet.
    pub fn success_rate(&self) -> f64 {
        let total = self.frames_sent + self.send_failures;
        if total == 0 {
            1.0
        } else {
            self.frames_sent as f64 / total as f64
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.success_rate() >= 0.8
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.connected_at.map(|at| at.elapsed())
    }
}

/// Relay connection
pub struct RelayConnection {
    /// Relay URL as configured, used as the relay's identity everywhere
    relay_url: String,
    /// Parsed URL handed to the connector
    url: Url,
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    state: Arc<RwLock<ConnectionState>>,
    transport: Arc<RwLock<Option<Arc<dyn Transport>>>>,
    /// Upward channel for frames and disconnections
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    /// Publishers waiting on `OK`, keyed by event id
    pending_confirmations: Arc<Mutex<HashMap<String, ConfirmationSender>>>,
    health: Arc<RwLock<RelayHealth>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Validates the URL; no I/O happens until [`connect`](Self::connect).
    pub fn new(
        relay_url: &str,
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self> {
        let url = Url::parse(relay_url)?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        Ok(Self {
            relay_url: relay_url.to_string(),
            url,
            config,
            connector,
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            transport: Arc::new(RwLock::new(None)),
            events_tx,
            pending_confirmations: Arc::new(Mutex::new(HashMap::new())),
            health: Arc::new(RwLock::new(RelayHealth::new(relay_url))),
            recv_task: Mutex::new(None),
        })
    }

    /// Open the socket. Only valid from `Idle`.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Idle => *state = ConnectionState::Connecting,
                ConnectionState::Connecting | ConnectionState::Open => {
                    return Err(ClientError::AlreadyConnected);
                }
                ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Error => {
                    return Err(ClientError::ConnectionTerminated(self.relay_url.clone()));
                }
            }
        }

        info!("Connecting to relay: {}", self.relay_url);

        let connect_start = Instant::now();
        let handle = match timeout(self.config.connect_timeout, self.connector.connect(&self.url))
            .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                self.fail(e.to_string()).await;
                return Err(e);
            }
            Err(_) => {
                self.fail("Connection timeout".to_string()).await;
                return Err(ClientError::Timeout(format!(
                    "Connection to {} timed out after {:?}",
                    self.relay_url, self.config.connect_timeout
                )));
            }
        };

        let TransportHandle { transport, events } = handle;
        *self.transport.write().await = Some(Arc::from(transport));
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Connecting {
                // closed while the handshake was in flight
                drop(state);
                if let Some(transport) = self.transport.write().await.take() {
                    let _ = transport.close().await;
                }
                return Err(ClientError::ConnectionTerminated(self.relay_url.clone()));
            }
            *state = ConnectionState::Open;
        }
        {
            let mut health = self.health.write().await;
            health.connected_at = Some(Instant::now());
            health.last_error = None;
        }

        info!(
            "Connected to relay: {} (took {:?})",
            self.relay_url,
            connect_start.elapsed()
        );

        self.start_recv_loop(events).await;
        Ok(())
    }

    async fn fail(&self, error: String) {
        *self.state.write().await = ConnectionState::Error;
        self.health.write().await.last_error = Some(error);
    }

    /// Spawn the reader task that drains the transport until it closes.
    async fn start_recv_loop(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let relay_url = self.relay_url.clone();
        let state = Arc::clone(&self.state);
        let transport = Arc::clone(&self.transport);
        let pending_confirmations = Arc::clone(&self.pending_confirmations);
        let health = Arc::clone(&self.health);
        let events_tx = self.events_tx.clone();

        let handle = tokio::spawn(async move {
            let (final_state, reason) = loop {
                let text = match events.recv().await {
                    Some(TransportEvent::Message(text)) => text,
                    Some(TransportEvent::Closed { reason }) => {
                        info!("Relay {} closed connection", relay_url);
                        break (
                            ConnectionState::Closed,
                            reason.unwrap_or_else(|| "closed by relay".to_string()),
                        );
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!("Transport error from {}: {}", relay_url, e);
                        break (ConnectionState::Error, e);
                    }
                    None => break (ConnectionState::Closed, "transport dropped".to_string()),
                };

                health.write().await.frames_received += 1;
                let message = match RelayMessage::from_json(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Ignoring malformed frame from {}: {}", relay_url, e);
                        continue;
                    }
                };

                // OK answers a publish on this connection and goes no further
                if let RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                } = message
                {
                    match pending_confirmations.lock().await.remove(&event_id) {
                        Some(tx) => {
                            let _ = tx.send(PublishConfirmation {
                                event_id,
                                accepted: success,
                                message,
                            });
                        }
                        None => debug!("Unsolicited OK for {} from {}", event_id, relay_url),
                    }
                    continue;
                }

                if events_tx
                    .send(ConnectionEvent::Message {
                        relay_url: relay_url.clone(),
                        message,
                    })
                    .is_err()
                {
                    debug!("Connection events for {} no longer observed", relay_url);
                }
            };

            {
                let mut current = state.write().await;
                if matches!(*current, ConnectionState::Closing | ConnectionState::Closed) {
                    return;
                }
                *current = final_state;
            }
            transport.write().await.take();
            // dropping the senders wakes any publish waiting for an OK
            pending_confirmations.lock().await.clear();
            health.write().await.last_error = Some(reason.clone());

            let _ = events_tx.send(ConnectionEvent::Disconnected { relay_url, reason });
        });

        *self.recv_task.lock().await = Some(handle);
    }

    /// Close the connection. Terminal; does not report a disconnection.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Closed | ConnectionState::Error => return Ok(()),
                ConnectionState::Idle => {
                    *state = ConnectionState::Closed;
                    return Ok(());
                }
                _ => *state = ConnectionState::Closing,
            }
        }

        info!("Disconnecting from relay: {}", self.relay_url);

        if let Some(handle) = self.recv_task.lock().await.take() {
            handle.abort();
        }
        let result = match self.transport.write().await.take() {
            Some(transport) => transport.close().await,
            None => Ok(()),
        };
        self.pending_confirmations.lock().await.clear();

        *self.state.write().await = ConnectionState::Closed;
        info!("Disconnected from relay: {}", self.relay_url);
        result
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Open
    }

    /// Send a message; fails fast unless the connection is open.
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }

        let text = message.to_json()?;
        debug!("Sending {} to {}", message.kind(), self.relay_url);

        let transport = self.transport.read().await.clone();
        let Some(transport) = transport else {
            return Err(ClientError::NotConnected);
        };

        match transport.send(text).await {
            Ok(()) => {
                self.health.write().await.frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                let mut health = self.health.write().await;
                health.send_failures += 1;
                health.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Publish an event and wait for the relay's OK.
    pub async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        let (tx, rx) = oneshot::channel();
        let event_id = event.id.clone();

        self.pending_confirmations
            .lock()
            .await
            .insert(event_id.clone(), tx);

        if let Err(e) = self.send(&ClientMessage::Event(event.clone())).await {
            self.pending_confirmations.lock().await.remove(&event_id);
            return Err(e);
        }

        match timeout(self.config.publish_timeout, rx).await {
            Ok(Ok(confirmation)) => Ok(confirmation),
            Ok(Err(_)) => Err(ClientError::PublishFailed(format!(
                "connection to {} closed before OK for {}",
                self.relay_url, event_id
            ))),
            Err(_) => {
                self.pending_confirmations.lock().await.remove(&event_id);
                Err(ClientError::Timeout(format!(
                    "Event confirmation timeout after {:?}",
                    self.config.publish_timeout
                )))
            }
        }
    }

    /// Relay URL as configured
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Get parsed relay URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Snapshot of connect and message counters.
    pub async fn health(&self) -> RelayHealth {
        self.health.read().await.clone()
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Ok(mut task) = self.recv_task.try_lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
        }
    }
}
