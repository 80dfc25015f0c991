//! Subscription records and their state machines.
//!
//! A subscription moves `Pending -> Active -> Eose`; `Closed` and `Error` are
//! terminal and `Closed` is reachable from every non-terminal state. Each
//! assigned relay carries its own [`RelayStatus`] next to the aggregate state.

use crate::backoff::RetryPolicy;
use crate::dedup::SeenEvents;
use crate::event::Event;
use crate::listener::{ListenerId, ListenerSet, SubscriptionListener};
use crate::message::Filter;
use crate::pool::RelaySendResult;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Length of generated subscription ids.
pub const SUBSCRIPTION_ID_LEN: usize = 16;

/// Generate a random 16 character lowercase hex subscription id.
pub fn generate_subscription_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(SUBSCRIPTION_ID_LEN);
    id
}

/// Aggregate subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Created, REQ not accepted by any relay yet
    Pending,
    /// At least one relay accepted the REQ
    Active,
    /// Every accepting relay reported end of stored events
    Eose,
    /// Closed by the caller
    Closed,
    /// Failed (all relays failed, timeout, or relay loss)
    Error,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionState::Closed | SubscriptionState::Error)
    }

    /// Forward-only ordering; terminal states accept nothing.
    pub fn can_transition_to(self, next: SubscriptionState) -> bool {
        use SubscriptionState::*;
        match (self, next) {
            (Closed | Error, _) => false,
            (_, Closed | Error) => true,
            (Pending, Active) => true,
            (Active, Eose) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Active => "active",
            SubscriptionState::Eose => "eose",
            SubscriptionState::Closed => "closed",
            SubscriptionState::Error => "error",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one subscription on one relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelaySubscriptionState {
    Pending,
    Active,
    Disconnected,
    Error,
}

impl RelaySubscriptionState {
    /// Still able to deliver events for the subscription.
    pub fn is_viable(self) -> bool {
        matches!(
            self,
            RelaySubscriptionState::Pending | RelaySubscriptionState::Active
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStatus {
    pub state: RelaySubscriptionState,
    pub eose_received: bool,
}

impl RelayStatus {
    fn pending() -> Self {
        Self {
            state: RelaySubscriptionState::Pending,
            eose_received: false,
        }
    }
}

/// Per-subscription configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
    /// Explicit relay set; `None` means every relay connected at creation
    pub relays: Option<Vec<String>>,
    /// Retry policy for the REQ send on each relay
    pub retry: RetryPolicy,
    /// Give up if EOSE has not arrived this long after activation
    pub timeout: Option<Duration>,
    /// Send the REQ as part of `subscribe`
    pub auto_activate: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            relays: None,
            retry: RetryPolicy::default(),
            timeout: Some(Duration::from_secs(30)),
            auto_activate: true,
        }
    }
}

impl SubscriptionOptions {
    pub fn relays(mut self, relays: Vec<String>) -> Self {
        self.relays = Some(relays);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register without sending the REQ; call `activate` later.
    pub fn deferred(mut self) -> Self {
        self.auto_activate = false;
        self
    }
}

/// Failure categories reported to callers and listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionErrorKind {
    /// Bad filters or options; nothing was created
    Validation,
    /// A relay connection failed
    Transport,
    /// No EOSE within the configured window
    Timeout,
    /// Some relays refused the REQ; only visible through relay results
    PartialRelayFailure,
    /// Every assigned relay refused the REQ
    TotalRelayFailure,
    /// No relay was available to assign
    NoRelays,
    /// Closed before activation finished
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct SubscriptionError {
    pub kind: SubscriptionErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl SubscriptionError {
    pub fn new(kind: SubscriptionErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            SubscriptionErrorKind::Transport
                | SubscriptionErrorKind::TotalRelayFailure
                | SubscriptionErrorKind::NoRelays
        );
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(SubscriptionErrorKind::Validation, message)
    }
}

/// Snapshot of a subscription handed out to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub filters: Vec<Filter>,
    pub state: SubscriptionState,
    pub relays: Vec<String>,
    pub event_count: u64,
    /// Unix seconds
    pub created_at: u64,
    /// Unix seconds of the last fresh event
    pub last_event_at: Option<u64>,
}

/// Detailed per-relay view of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionStats {
    pub info: SubscriptionInfo,
    pub relay_states: HashMap<String, RelayStatus>,
    /// Relays that have reported EOSE
    pub eose_count: usize,
    /// Relays that accepted the REQ
    pub accepted_relays: usize,
    pub activated_at: Option<Instant>,
}

/// Outcome of `subscribe` and `activate`.
#[derive(Debug, Clone)]
pub struct SubscriptionResult {
    pub success: bool,
    pub subscription: Option<SubscriptionInfo>,
    pub relay_results: Vec<RelaySendResult>,
    pub error: Option<SubscriptionError>,
}

impl SubscriptionResult {
    pub(crate) fn ok(info: SubscriptionInfo, relay_results: Vec<RelaySendResult>) -> Self {
        Self {
            success: true,
            subscription: Some(info),
            relay_results,
            error: None,
        }
    }

    pub(crate) fn failed(error: SubscriptionError) -> Self {
        Self {
            success: false,
            subscription: None,
            relay_results: Vec::new(),
            error: Some(error),
        }
    }

    /// Relays that refused the REQ even though the subscription succeeded.
    pub fn partial_failures(&self) -> impl Iterator<Item = &RelaySendResult> {
        self.relay_results.iter().filter(|r| !r.success)
    }

    /// Non-fatal summary of [`SubscriptionResult::partial_failures`].
    pub fn warning(&self) -> Option<SubscriptionError> {
        if !self.success {
            return None;
        }
        let failed: Vec<&str> = self
            .partial_failures()
            .map(|r| r.relay_url.as_str())
            .collect();
        if failed.is_empty() {
            return None;
        }
        Some(SubscriptionError::new(
            SubscriptionErrorKind::PartialRelayFailure,
            format!(
                "REQ refused by {} of {} relays: {}",
                failed.len(),
                self.relay_results.len(),
                failed.join(", ")
            ),
        ))
    }

    pub fn id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.id.as_str())
    }
}

/// Live subscription owned by the manager.
pub(crate) struct Subscription {
    pub id: String,
    /// Registration order within the manager
    pub seq: u64,
    pub filters: Vec<Filter>,
    pub state: SubscriptionState,
    /// Assigned relays in assignment order
    pub relays: Vec<String>,
    pub relay_status: HashMap<String, RelayStatus>,
    /// Relays that accepted the REQ
    pub accepted: HashSet<String>,
    pub explicit_relays: bool,
    pub options: SubscriptionOptions,
    pub event_count: u64,
    pub created_at: u64,
    pub last_event_at: Option<u64>,
    pub activation_started: bool,
    pub activated_at: Option<Instant>,
    pub deadline: Option<Instant>,
    pub listeners: ListenerSet,
    pub seen: SeenEvents,
}

impl Subscription {
    pub fn new(
        id: String,
        filters: Vec<Filter>,
        relays: Vec<String>,
        options: SubscriptionOptions,
        created_at: u64,
        dedup_capacity: usize,
    ) -> Self {
        let relay_status = relays
            .iter()
            .map(|url| (url.clone(), RelayStatus::pending()))
            .collect();
        Self {
            id,
            seq: 0,
            filters,
            state: SubscriptionState::Pending,
            explicit_relays: options.relays.is_some(),
            relays,
            relay_status,
            accepted: HashSet::new(),
            options,
            event_count: 0,
            created_at,
            last_event_at: None,
            activation_started: false,
            activated_at: None,
            deadline: None,
            listeners: ListenerSet::default(),
            seen: SeenEvents::new(dedup_capacity),
        }
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: SubscriptionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    pub fn has_relay(&self, relay_url: &str) -> bool {
        self.relay_status.contains_key(relay_url)
    }

    pub fn set_relay_state(&mut self, relay_url: &str, state: RelaySubscriptionState) {
        if let Some(status) = self.relay_status.get_mut(relay_url) {
            status.state = state;
        }
    }

    pub fn has_viable_relay(&self) -> bool {
        self.relay_status.values().any(|s| s.state.is_viable())
    }

    /// Every relay that accepted the REQ and has not since dropped the
    /// subscription has reported EOSE.
    pub fn eose_complete(&self) -> bool {
        let mut waiting_on = self.accepted.iter().filter_map(|url| self.relay_status.get(url));
        let mut any = false;
        let done = waiting_on.all(|status| {
            if status.state == RelaySubscriptionState::Error {
                return true;
            }
            any = true;
            status.eose_received
        });
        any && done
    }

    /// Record a delivered event. Returns false for duplicates.
    pub fn record_event(&mut self, event: &Event, now: u64) -> bool {
        if !self.seen.insert(&event.id) {
            return false;
        }
        self.event_count += 1;
        self.last_event_at = Some(now);
        true
    }

    /// Record `events` and notify listeners of the fresh ones.
    pub fn deliver(&mut self, events: &[Event], now: u64) -> usize {
        self.seen.reserve(events.len());
        let mut fresh = 0;
        for event in events {
            if self.record_event(event, now) {
                fresh += 1;
                self.listeners.notify_event(&self.id, event);
            }
        }
        fresh
    }

    pub fn add_listener(&mut self, listener: Box<dyn SubscriptionListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            filters: self.filters.clone(),
            state: self.state,
            relays: self.relays.clone(),
            event_count: self.event_count,
            created_at: self.created_at,
            last_event_at: self.last_event_at,
        }
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            info: self.info(),
            relay_states: self.relay_status.clone(),
            eose_count: self.relay_status.values().filter(|s| s.eose_received).count(),
            accepted_relays: self.accepted.len(),
            activated_at: self.activated_at,
        }
    }
}
