//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns one [`RelayConnection`] per configured URL and a supervisor
//! task. Every connection reports into the supervisor through one channel;
//! the supervisor fans [`PoolEvent`]s out to registered observers and replaces
//! connections that dropped, backing off between attempts.

use crate::backoff::ExponentialBackoff;
use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::message::{ClientMessage, RelayMessage};
use crate::relay::{ConnectionEvent, PublishConfirmation, RelayConfig, RelayConnection};
use crate::transport::Connector;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events emitted by the relay pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A relay connected (initially or after reconnection)
    Connected { relay_url: String },
    /// A relay disconnected
    Disconnected { relay_url: String, reason: String },
    /// A frame from a relay (OK frames are consumed by the publish path)
    Message {
        relay_url: String,
        message: RelayMessage,
    },
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub relay: RelayConfig,
    /// Replace dropped connections automatically
    pub auto_reconnect: bool,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// 0 = keep trying
    pub max_reconnect_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            auto_reconnect: true,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: 0,
        }
    }
}

impl PoolConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.reconnect_base_delay,
            self.reconnect_max_delay,
            self.max_reconnect_attempts,
        )
    }
}

/// Result of sending one frame to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySendResult {
    pub relay_url: String,
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

impl RelaySendResult {
    pub(crate) fn from_result(relay_url: &str, result: &Result<()>, attempts: u32) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            attempts,
        }
    }
}

/// Last connection attempt for a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub relay_url: String,
    pub connected: bool,
    pub error: Option<String>,
}

/// Summary of [`RelayPool::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectReport {
    pub connected: Vec<String>,
    pub failed: Vec<ConnectOutcome>,
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_relays: usize,
    pub connected_relays: usize,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub send_failures: u64,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    /// Configured relay URLs, in insertion order
    relays: RwLock<Vec<String>>,
    /// Connections indexed by URL
    connections: RwLock<HashMap<String, Arc<RelayConnection>>>,
    outcomes: RwLock<HashMap<String, ConnectOutcome>>,
    observers: parking_lot::Mutex<Vec<mpsc::UnboundedSender<PoolEvent>>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Set by `disconnect_all`; stops pending reconnection loops
    shut_down: AtomicBool,
}

impl PoolInner {
    fn emit(&self, event: PoolEvent) {
        self.observers
            .lock()
            .retain(|observer| observer.send(event.clone()).is_ok());
    }

    async fn is_configured(&self, url: &str) -> bool {
        self.relays.read().await.iter().any(|r| r == url)
    }

    async fn record_outcome(&self, url: &str, result: &Result<()>) {
        self.outcomes.write().await.insert(
            url.to_string(),
            ConnectOutcome {
                relay_url: url.to_string(),
                connected: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            },
        );
    }

    /// Open a fresh connection for `url` and install it.
    async fn open(&self, url: &str) -> Result<()> {
        let conn = Arc::new(RelayConnection::new(
            url,
            self.config.relay.clone(),
            self.connector.clone(),
            self.events_tx.clone(),
        )?);
        let result = conn.connect().await;
        self.record_outcome(url, &result).await;
        result?;

        if self.shut_down.load(Ordering::SeqCst) || !self.is_configured(url).await {
            let _ = conn.close().await;
            return Err(ClientError::ConnectionTerminated(url.to_string()));
        }

        let previous = self
            .connections
            .write()
            .await
            .insert(url.to_string(), conn);
        if let Some(previous) = previous {
            let _ = previous.close().await;
        }

        self.emit(PoolEvent::Connected {
            relay_url: url.to_string(),
        });
        Ok(())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Ok(mut supervisor) = self.supervisor.try_lock()
            && let Some(handle) = supervisor.take()
        {
            handle.abort();
        }
    }
}

/// A pool of Nostr relay connections.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Create a pool for `relays`. Nothing connects until [`RelayPool::connect`].
    pub fn new(relays: Vec<String>, config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut unique: Vec<String> = Vec::with_capacity(relays.len());
        for relay in relays {
            if !unique.contains(&relay) {
                unique.push(relay);
            }
        }

        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                relays: RwLock::new(unique),
                connections: RwLock::new(HashMap::new()),
                outcomes: RwLock::new(HashMap::new()),
                observers: parking_lot::Mutex::new(Vec::new()),
                events_tx,
                events_rx: parking_lot::Mutex::new(Some(events_rx)),
                supervisor: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Receive every [`PoolEvent`] from now on.
    pub fn register_observer(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.observers.lock().push(tx);
        rx
    }

    async fn ensure_supervisor(&self) {
        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.is_some() {
            return;
        }
        let Some(events_rx) = self.inner.events_rx.lock().take() else {
            return;
        };
        *supervisor = Some(tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            events_rx,
        )));
    }

    /// Connect every configured relay that is not connected yet.
    ///
    /// Succeeds if at least one relay is connected afterwards.
    pub async fn connect(&self) -> Result<ConnectReport> {
        self.inner.shut_down.store(false, Ordering::SeqCst);
        self.ensure_supervisor().await;

        let urls = self.relay_urls().await;
        let mut pending = Vec::new();
        for url in &urls {
            if !self.is_connected(url).await {
                pending.push(url.clone());
            }
        }

        let attempts = join_all(pending.iter().map(|url| self.inner.open(url))).await;

        let mut failed = Vec::new();
        for (url, result) in pending.iter().zip(attempts) {
            if let Err(e) = result {
                warn!("Failed to connect to {}: {}", url, e);
                failed.push(ConnectOutcome {
                    relay_url: url.clone(),
                    connected: false,
                    error: Some(e.to_string()),
                });
            }
        }

        let connected = self.connected_relays().await;
        info!(
            "Connected to {}/{} relays",
            connected.len(),
            urls.len()
        );
        if connected.is_empty() {
            return Err(ClientError::NoRelaysConnected(urls.len()));
        }
        Ok(ConnectReport { connected, failed })
    }

    /// Connect a single configured relay.
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        if !self.inner.is_configured(url).await {
            return Err(ClientError::UnknownRelay(url.to_string()));
        }
        if self.is_connected(url).await {
            return Err(ClientError::AlreadyConnected);
        }
        self.inner.shut_down.store(false, Ordering::SeqCst);
        self.ensure_supervisor().await;
        self.inner.open(url).await
    }

    /// Add a relay to the pool. Does not connect.
    pub async fn add_relay(&self, url: impl Into<String>) -> Result<()> {
        let url = url.into();
        let parsed = url::Url::parse(&url)?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(url));
        }

        let mut relays = self.inner.relays.write().await;
        if !relays.contains(&url) {
            info!("Adding relay to pool: {}", url);
            relays.push(url);
        }
        Ok(())
    }

    /// Remove a relay from the pool, closing its connection.
    pub async fn remove_relay(&self, url: &str) -> bool {
        let removed = {
            let mut relays = self.inner.relays.write().await;
            let before = relays.len();
            relays.retain(|r| r != url);
            relays.len() != before
        };
        if !removed {
            return false;
        }

        info!("Removing relay from pool: {}", url);
        let conn = self.inner.connections.write().await.remove(url);
        self.inner.outcomes.write().await.remove(url);
        if let Some(conn) = conn {
            let _ = conn.close().await;
            self.inner.emit(PoolEvent::Disconnected {
                relay_url: url.to_string(),
                reason: "removed from pool".to_string(),
            });
        }
        true
    }

    /// Close every connection and stop reconnecting.
    pub async fn disconnect_all(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let conns: Vec<_> = self.inner.connections.write().await.drain().collect();
        for (url, conn) in conns {
            let was_open = conn.is_connected().await;
            if let Err(e) = conn.close().await {
                debug!("Error closing {}: {}", url, e);
            }
            if was_open {
                self.inner.emit(PoolEvent::Disconnected {
                    relay_url: url,
                    reason: "disconnected".to_string(),
                });
            }
        }
    }

    /// Get all configured relay URLs.
    pub async fn relay_urls(&self) -> Vec<String> {
        self.inner.relays.read().await.clone()
    }

    /// Check if a relay is connected.
    pub async fn is_connected(&self, url: &str) -> bool {
        let conn = self.inner.connections.read().await.get(url).cloned();
        match conn {
            Some(conn) => conn.is_connected().await,
            None => false,
        }
    }

    /// Relays with an open connection, in configuration order.
    pub async fn connected_relays(&self) -> Vec<String> {
        let mut connected = Vec::new();
        for url in self.relay_urls().await {
            if self.is_connected(&url).await {
                connected.push(url);
            }
        }
        connected
    }

    /// Outcome of the latest connection attempt per relay.
    pub async fn connect_outcomes(&self) -> Vec<ConnectOutcome> {
        let outcomes = self.inner.outcomes.read().await;
        self.relay_urls()
            .await
            .iter()
            .filter_map(|url| outcomes.get(url).cloned())
            .collect()
    }

    /// Send one frame to one relay.
    pub async fn send_to(&self, url: &str, message: &ClientMessage) -> Result<()> {
        let conn = self.inner.connections.read().await.get(url).cloned();
        match conn {
            Some(conn) => conn.send(message).await,
            None if self.inner.is_configured(url).await => Err(ClientError::NotConnected),
            None => Err(ClientError::UnknownRelay(url.to_string())),
        }
    }

    /// Send to specific relays concurrently, one attempt each.
    pub async fn send_to_relays(
        &self,
        urls: &[String],
        message: &ClientMessage,
    ) -> Vec<RelaySendResult> {
        join_all(urls.iter().map(|url| async move {
            let result = self.send_to(url, message).await;
            if let Err(e) = &result {
                debug!("{} to {} failed: {}", message.kind(), url, e);
            }
            RelaySendResult::from_result(url, &result, 1)
        }))
        .await
    }

    /// Best-effort broadcast to every connected relay.
    pub async fn send_to_all(&self, message: &ClientMessage) -> Vec<RelaySendResult> {
        let connected = self.connected_relays().await;
        self.send_to_relays(&connected, message).await
    }

    /// Publish an event to all connected relays and collect their OKs.
    pub async fn publish(&self, event: &Event) -> Vec<(String, Result<PublishConfirmation>)> {
        let conns: Vec<_> = self
            .inner
            .connections
            .read()
            .await
            .iter()
            .map(|(url, conn)| (url.clone(), conn.clone()))
            .collect();

        join_all(conns.into_iter().map(|(url, conn)| async move {
            if !conn.is_connected().await {
                return (url, Err(ClientError::NotConnected));
            }
            let result = conn.publish(event).await;
            (url, result)
        }))
        .await
        .into_iter()
        .filter(|(_, result)| !matches!(result, Err(ClientError::NotConnected)))
        .collect()
    }

    /// Aggregate counters over current connections.
    pub async fn stats(&self) -> PoolStats {
        let conns: Vec<_> = self.inner.connections.read().await.values().cloned().collect();
        let mut stats = PoolStats {
            total_relays: self.inner.relays.read().await.len(),
            ..PoolStats::default()
        };
        for conn in conns {
            if conn.is_connected().await {
                stats.connected_relays += 1;
            }
            let health = conn.health().await;
            stats.frames_sent += health.frames_sent;
            stats.frames_received += health.frames_received;
            stats.send_failures += health.send_failures;
        }
        stats
    }

    /// Health of the current connection to `url`.
    pub async fn relay_health(&self, url: &str) -> Option<crate::relay::RelayHealth> {
        let conn = self.inner.connections.read().await.get(url).cloned()?;
        Some(conn.health().await)
    }
}

/// Forward connection events to observers and schedule replacements.
async fn supervise(inner: Weak<PoolInner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(pool) = inner.upgrade() else {
            break;
        };
        match event {
            ConnectionEvent::Message { relay_url, message } => {
                if let RelayMessage::Notice { message } = &message {
                    info!("NOTICE from {}: {}", relay_url, message);
                }
                pool.emit(PoolEvent::Message { relay_url, message });
            }
            ConnectionEvent::Disconnected { relay_url, reason } => {
                warn!("Relay {} disconnected: {}", relay_url, reason);
                pool.emit(PoolEvent::Disconnected {
                    relay_url: relay_url.clone(),
                    reason,
                });
                if pool.config.auto_reconnect && !pool.shut_down.load(Ordering::SeqCst) {
                    tokio::spawn(reconnect(Arc::downgrade(&pool), relay_url));
                }
            }
        }
    }
    debug!("Pool supervisor stopped");
}

async fn reconnect(inner: Weak<PoolInner>, relay_url: String) {
    let Some(mut backoff) = inner.upgrade().map(|pool| pool.config.backoff()) else {
        return;
    };

    while let Some(delay) = backoff.next_delay() {
        debug!(
            "Reconnecting to {} in {:?} (attempt {})",
            relay_url,
            delay,
            backoff.attempt()
        );
        tokio::time::sleep(delay).await;

        let Some(pool) = inner.upgrade() else {
            return;
        };
        if pool.shut_down.load(Ordering::SeqCst) || !pool.is_configured(&relay_url).await {
            return;
        }
        let already_open = match pool.connections.read().await.get(&relay_url).cloned() {
            Some(conn) => conn.is_connected().await,
            None => false,
        };
        if already_open {
            return;
        }

        match pool.open(&relay_url).await {
            Ok(()) => {
                info!("Reconnected to {}", relay_url);
                return;
            }
            Err(e) => warn!("Reconnect to {} failed: {}", relay_url, e),
        }
    }
    warn!("Giving up on {} after {} attempts", relay_url, backoff.attempt());
}
