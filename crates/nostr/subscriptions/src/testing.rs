//! In-memory relays and helpers for tests.
//!
//! [`MockConnector`] stands in for the WebSocket connector. Each URL gets a
//! [`MockRelay`] handle that scripts failures, records every frame the client
//! sent and pushes frames back as if the relay had sent them.

use crate::error::{ClientError, Result};
use crate::event::{Event, Signer, SignerError, UnsignedEvent};
use crate::listener::{ListenerError, SubscriptionListener};
use crate::subscription::SubscriptionError;
use crate::transport::{Connector, Transport, TransportEvent, TransportHandle};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// Public key used by [`text_note`].
pub const TEST_PUBKEY: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

/// A kind-1 event whose id is `n` as 64 hex digits.
pub fn text_note(n: u64, content: &str) -> Event {
    Event {
        id: format!("{:064x}", n),
        pubkey: TEST_PUBKEY.to_string(),
        created_at: 1_700_000_000 + n,
        kind: 1,
        tags: Vec::new(),
        content: content.to_string(),
        sig: "0".repeat(128),
    }
}

fn normalize(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

#[derive(Default)]
struct MockRelayState {
    fail_connect: bool,
    hang_connect: bool,
    fail_next_sends: u32,
    fail_all_sends: bool,
    auto_eose: bool,
    auto_ok: bool,
    sent: Vec<String>,
    send_attempts: u32,
    connection_count: u32,
    /// Bumped per connection so stale transports stop working
    generation: u64,
    events_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// Scripting handle for one in-memory relay.
#[derive(Clone, Default)]
pub struct MockRelay {
    state: Arc<Mutex<MockRelayState>>,
}

impl MockRelay {
    /// Refuse (or accept again) new connections.
    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Never finish connecting.
    pub fn hang_connect(&self, hang: bool) {
        self.state.lock().hang_connect = hang;
    }

    /// Fail the next `n` sends.
    pub fn fail_next_sends(&self, n: u32) {
        self.state.lock().fail_next_sends = n;
    }

    pub fn fail_all_sends(&self, fail: bool) {
        self.state.lock().fail_all_sends = fail;
    }

    /// Answer every REQ with an immediate EOSE.
    pub fn auto_eose(&self, enabled: bool) {
        self.state.lock().auto_eose = enabled;
    }

    /// Accept every published EVENT with an OK.
    pub fn auto_ok(&self, enabled: bool) {
        self.state.lock().auto_ok = enabled;
    }

    /// Frames delivered to this relay, across all connections.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Delivered frames parsed as JSON.
    pub fn sent_messages(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Delivered frames whose tag is `kind` ("REQ", "CLOSE", "EVENT").
    pub fn sent_of_kind(&self, kind: &str) -> Vec<Value> {
        self.sent_messages()
            .into_iter()
            .filter(|msg| msg.get(0).and_then(Value::as_str) == Some(kind))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Sends attempted, including failed ones.
    pub fn send_attempts(&self) -> u32 {
        self.state.lock().send_attempts
    }

    pub fn connection_count(&self) -> u32 {
        self.state.lock().connection_count
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().events_tx.is_some()
    }

    /// Deliver a raw text frame to the client. Returns false when no
    /// connection is open.
    pub fn push(&self, text: &str) -> bool {
        let state = self.state.lock();
        match &state.events_tx {
            Some(tx) => tx.send(TransportEvent::Message(text.to_string())).is_ok(),
            None => false,
        }
    }

    pub fn push_json(&self, value: Value) -> bool {
        self.push(&value.to_string())
    }

    /// `["EVENT", subscription_id, event]`
    pub fn send_event(&self, subscription_id: &str, event: &Event) -> bool {
        self.push_json(json!(["EVENT", subscription_id, event]))
    }

    /// `["EOSE", subscription_id]`
    pub fn send_eose(&self, subscription_id: &str) -> bool {
        self.push_json(json!(["EOSE", subscription_id]))
    }

    /// Close the connection from the relay side.
    pub fn drop_connection(&self, reason: Option<&str>) {
        if let Some(tx) = self.state.lock().events_tx.take() {
            let _ = tx.send(TransportEvent::Closed {
                reason: reason.map(str::to_string),
            });
        }
    }

    /// Fail the connection with a transport error.
    pub fn fail_transport(&self, error: &str) {
        if let Some(tx) = self.state.lock().events_tx.take() {
            let _ = tx.send(TransportEvent::Error(error.to_string()));
        }
    }

    fn open(&self) -> Option<(u64, mpsc::UnboundedReceiver<TransportEvent>)> {
        let mut state = self.state.lock();
        if state.fail_connect {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.connection_count += 1;
        state.generation += 1;
        state.events_tx = Some(tx);
        Some((state.generation, rx))
    }

    fn deliver(&self, generation: u64, text: String) -> Result<()> {
        let mut state = self.state.lock();
        state.send_attempts += 1;
        if state.generation != generation || state.events_tx.is_none() {
            return Err(ClientError::WebSocket("mock connection closed".into()));
        }
        if state.fail_all_sends {
            return Err(ClientError::WebSocket("mock send failure".into()));
        }
        if state.fail_next_sends > 0 {
            state.fail_next_sends -= 1;
            return Err(ClientError::WebSocket("mock send failure".into()));
        }

        let reply = match serde_json::from_str::<Value>(&text) {
            Ok(frame) => match frame.get(0).and_then(Value::as_str) {
                Some("REQ") if state.auto_eose => frame
                    .get(1)
                    .map(|id| json!(["EOSE", id]).to_string()),
                Some("EVENT") if state.auto_ok => frame
                    .get(1)
                    .and_then(|event| event.get("id"))
                    .map(|id| json!(["OK", id, true, ""]).to_string()),
                _ => None,
            },
            Err(_) => None,
        };
        state.sent.push(text);
        if let (Some(reply), Some(tx)) = (reply, &state.events_tx) {
            let _ = tx.send(TransportEvent::Message(reply));
        }
        Ok(())
    }

    fn close_generation(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.events_tx = None;
        }
    }
}

/// Connector that opens in-memory transports to [`MockRelay`]s.
#[derive(Default)]
pub struct MockConnector {
    relays: Mutex<HashMap<String, MockRelay>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handle for `url`, created on first use.
    pub fn relay(&self, url: &str) -> MockRelay {
        self.relays
            .lock()
            .entry(normalize(url))
            .or_default()
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<TransportHandle> {
        let relay = self.relay(url.as_str());
        let hang = relay.state.lock().hang_connect;
        if hang {
            futures::future::pending::<()>().await;
        }

        let Some((generation, events)) = relay.open() else {
            return Err(ClientError::Connection(format!("{} refused connection", url)));
        };
        debug!("Mock connection {} to {}", generation, url);

        Ok(TransportHandle {
            transport: Box::new(MockTransport { relay, generation }),
            events,
        })
    }
}

struct MockTransport {
    relay: MockRelay,
    generation: u64,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, text: String) -> Result<()> {
        self.relay.deliver(self.generation, text)
    }

    async fn close(&self) -> Result<()> {
        self.relay.close_generation(self.generation);
        Ok(())
    }
}

#[derive(Default)]
struct Recording {
    events: Vec<Event>,
    eose: Vec<String>,
    closes: Vec<Option<String>>,
    errors: Vec<SubscriptionError>,
}

/// Listener that remembers every callback.
#[derive(Clone, Default)]
pub struct RecordingListener {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.inner.lock().events.iter().map(|e| e.id.clone()).collect()
    }

    /// Relays whose EOSE was reported, in order.
    pub fn eose_relays(&self) -> Vec<String> {
        self.inner.lock().eose.clone()
    }

    pub fn close_reasons(&self) -> Vec<Option<String>> {
        self.inner.lock().closes.clone()
    }

    pub fn errors(&self) -> Vec<SubscriptionError> {
        self.inner.lock().errors.clone()
    }
}

impl SubscriptionListener for RecordingListener {
    fn on_event(&mut self, _subscription_id: &str, event: &Event) -> std::result::Result<(), ListenerError> {
        self.inner.lock().events.push(event.clone());
        Ok(())
    }

    fn on_eose(&mut self, _subscription_id: &str, relay_url: &str) -> std::result::Result<(), ListenerError> {
        self.inner.lock().eose.push(relay_url.to_string());
        Ok(())
    }

    fn on_close(&mut self, _subscription_id: &str, reason: Option<&str>) {
        self.inner.lock().closes.push(reason.map(str::to_string));
    }

    fn on_error(&mut self, _subscription_id: &str, error: &SubscriptionError) {
        self.inner.lock().errors.push(error.clone());
    }
}

/// Signer producing deterministic, unverifiable events.
pub struct TestSigner {
    public_key: String,
    counter: AtomicU64,
}

impl TestSigner {
    pub fn new() -> Self {
        Self {
            public_key: TEST_PUBKEY.to_string(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for TestSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Signer for TestSigner {
    async fn public_key(&self) -> std::result::Result<String, SignerError> {
        Ok(self.public_key.clone())
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> std::result::Result<Event, SignerError> {
        if unsigned.pubkey != self.public_key {
            return Err(SignerError::Rejected(format!(
                "cannot sign for {}",
                unsigned.pubkey
            )));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Event {
            id: format!("{:064x}", n),
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: "0".repeat(128),
        })
    }
}
