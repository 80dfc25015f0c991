//! Subscription coordination core.
//!
//! [`SubscriptionManager`] owns every live subscription, routes inbound relay
//! frames to them and drives their state machines. All methods take
//! `&mut self`: the manager belongs to exactly one task (see
//! [`crate::client`]) and needs no locks. Sending the REQ is split into
//! [`SubscriptionManager::prepare_activation`], a detached
//! [`ActivationJob`] and [`SubscriptionManager::finish_activation`] so the
//! owning task can keep routing frames while retries back off.

use crate::backoff::{RetryPolicy, retry_with_policy};
use crate::clock::Clock;
use crate::event::Event;
use crate::listener::{ListenerId, SubscriptionListener};
use crate::message::{ClientMessage, Filter, RelayMessage, validate_filters};
use crate::pool::{RelayPool, RelaySendResult};
use crate::subscription::{
    RelaySubscriptionState, Subscription, SubscriptionError, SubscriptionErrorKind,
    SubscriptionInfo, SubscriptionOptions, SubscriptionResult, SubscriptionState,
    SubscriptionStats, generate_subscription_id,
};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Close reason reported to listeners when the EOSE window expires.
pub const TIMEOUT_CLOSE_REASON: &str = "Subscription timeout";

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Event ids remembered per subscription for deduplication
    pub dedup_capacity: usize,
    /// Closed subscriptions kept for lookup
    pub history_capacity: usize,
    /// Options used by callers that do not pass their own
    pub default_options: SubscriptionOptions,
    /// Frames ingested by the coordinator before it yields
    pub ingest_chunk_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 10_000,
            history_capacity: 100,
            default_options: SubscriptionOptions::default(),
            ingest_chunk_size: 256,
        }
    }
}

/// Pending REQ fan-out for one subscription.
pub struct ActivationJob {
    subscription_id: String,
    message: ClientMessage,
    relays: Vec<String>,
    retry: RetryPolicy,
    pool: RelayPool,
    clock: Arc<dyn Clock>,
}

impl ActivationJob {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Send the REQ to every assigned relay concurrently, retrying each per
    /// the subscription's policy.
    pub async fn run(self) -> ActivationReport {
        let pool = &self.pool;
        let message = &self.message;
        let retry = &self.retry;
        let clock = self.clock.as_ref();
        let id = self.subscription_id.as_str();

        let relay_results = join_all(self.relays.iter().map(|relay| async move {
            let outcome = retry_with_policy(retry, clock, || pool.send_to(relay, message)).await;
            if let Err(e) = &outcome.result {
                warn!(
                    "REQ {} to {} failed after {} attempts: {}",
                    id, relay, outcome.attempts, e
                );
            }
            RelaySendResult::from_result(relay, &outcome.result, outcome.attempts)
        }))
        .await;

        ActivationReport {
            subscription_id: self.subscription_id,
            relay_results,
        }
    }
}

/// Per-relay outcome of an [`ActivationJob`].
#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub subscription_id: String,
    pub relay_results: Vec<RelaySendResult>,
}

/// What to do next after `prepare_subscribe` / `prepare_activation`.
pub enum ActivationStep {
    /// Nothing to send; this is the final result
    Done(SubscriptionResult),
    /// Run the job, then hand its report to `finish_activation`
    Send(ActivationJob),
}

/// Parse untyped JSON filters, rejecting anything malformed.
pub fn parse_filters(values: Vec<Value>) -> Result<Vec<Filter>, SubscriptionError> {
    let filters = values
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            Filter::from_value(value)
                .map_err(|e| SubscriptionError::validation(format!("filter {}: {}", i, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    validate_filters(&filters).map_err(|e| SubscriptionError::validation(e.to_string()))?;
    Ok(filters)
}

pub struct SubscriptionManager {
    pool: RelayPool,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
    active: HashMap<String, Subscription>,
    history: VecDeque<SubscriptionStats>,
    next_seq: u64,
}

impl SubscriptionManager {
    pub fn new(pool: RelayPool, clock: Arc<dyn Clock>, config: ManagerConfig) -> Self {
        Self {
            pool,
            clock,
            config,
            active: HashMap::new(),
            history: VecDeque::new(),
            next_seq: 0,
        }
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Create a subscription and, unless deferred, send its REQ.
    pub async fn subscribe(
        &mut self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> SubscriptionResult {
        self.subscribe_with(filters, options, Vec::new()).await
    }

    /// Like [`SubscriptionManager::subscribe`], attaching `listeners` before
    /// any frame can be routed.
    pub async fn subscribe_with(
        &mut self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
        listeners: Vec<Box<dyn SubscriptionListener>>,
    ) -> SubscriptionResult {
        let step = self.prepare_subscribe(filters, options, listeners).await;
        self.drive(step).await
    }

    /// Subscribe with filters given as raw JSON values.
    pub async fn subscribe_json(
        &mut self,
        filters: Vec<Value>,
        options: SubscriptionOptions,
    ) -> SubscriptionResult {
        match parse_filters(filters) {
            Ok(filters) => self.subscribe(filters, options).await,
            Err(error) => SubscriptionResult::failed(error),
        }
    }

    /// Send the REQ of a deferred subscription. No-op once sent.
    pub async fn activate(&mut self, id: &str) -> SubscriptionResult {
        let step = self.prepare_activation(id);
        self.drive(step).await
    }

    async fn drive(&mut self, step: ActivationStep) -> SubscriptionResult {
        match step {
            ActivationStep::Done(result) => result,
            ActivationStep::Send(job) => {
                let report = job.run().await;
                self.finish_activation(report).await
            }
        }
    }

    /// Validate and register a subscription without doing any I/O.
    pub async fn prepare_subscribe(
        &mut self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
        listeners: Vec<Box<dyn SubscriptionListener>>,
    ) -> ActivationStep {
        if let Err(e) = validate_filters(&filters) {
            return ActivationStep::Done(SubscriptionResult::failed(
                SubscriptionError::validation(e.to_string()),
            ));
        }
        if options.timeout.is_some_and(|t| t.is_zero()) {
            return ActivationStep::Done(SubscriptionResult::failed(
                SubscriptionError::validation("timeout must be greater than zero"),
            ));
        }

        let relays = match &options.relays {
            Some(explicit) => match validate_relays(explicit) {
                Ok(relays) => relays,
                Err(error) => return ActivationStep::Done(SubscriptionResult::failed(error)),
            },
            None => self.pool.connected_relays().await,
        };
        if relays.is_empty() {
            return ActivationStep::Done(SubscriptionResult::failed(SubscriptionError::new(
                SubscriptionErrorKind::NoRelays,
                "no connected relays to subscribe on",
            )));
        }

        let id = self.unique_id();
        let auto_activate = options.auto_activate;
        let mut subscription = Subscription::new(
            id.clone(),
            filters,
            relays,
            options,
            self.clock.unix_timestamp(),
            self.config.dedup_capacity,
        );
        subscription.seq = self.next_seq;
        self.next_seq += 1;
        for listener in listeners {
            subscription.add_listener(listener);
        }

        info!(
            "Created subscription {} on {} relays",
            id,
            subscription.relays.len()
        );
        let info = subscription.info();
        self.active.insert(id.clone(), subscription);

        if auto_activate {
            self.prepare_activation(&id)
        } else {
            ActivationStep::Done(SubscriptionResult::ok(info, Vec::new()))
        }
    }

    /// Start activation: arm the timeout and build the REQ fan-out.
    pub fn prepare_activation(&mut self, id: &str) -> ActivationStep {
        let now = self.clock.now();
        let Some(sub) = self.active.get_mut(id) else {
            let message = match self.history_entry(id) {
                Some(stats) => format!("subscription {} is {}", id, stats.info.state),
                None => format!("unknown subscription {}", id),
            };
            return ActivationStep::Done(SubscriptionResult::failed(
                SubscriptionError::validation(message),
            ));
        };

        if sub.activation_started {
            return ActivationStep::Done(SubscriptionResult::ok(sub.info(), Vec::new()));
        }
        sub.activation_started = true;
        sub.activated_at = Some(now);
        sub.deadline = sub.options.timeout.map(|timeout| now + timeout);

        debug!("Activating subscription {}", id);
        ActivationStep::Send(ActivationJob {
            subscription_id: id.to_string(),
            message: ClientMessage::req(id, sub.filters.clone()),
            relays: sub.relays.clone(),
            retry: sub.options.retry,
            pool: self.pool.clone(),
            clock: self.clock.clone(),
        })
    }

    /// Apply the outcome of an [`ActivationJob`].
    ///
    /// If the subscription was closed or expired while the REQ was in
    /// flight, every relay that accepted it is sent a CLOSE.
    pub async fn finish_activation(&mut self, report: ActivationReport) -> SubscriptionResult {
        let ActivationReport {
            subscription_id: id,
            relay_results,
        } = report;

        let Some(sub) = self.active.get_mut(&id) else {
            let late: Vec<String> = relay_results
                .iter()
                .filter(|r| r.success)
                .map(|r| r.relay_url.clone())
                .collect();
            debug!(
                "Dropping REQ results for finished subscription {}, closing on {} relays",
                id,
                late.len()
            );
            send_close(&self.pool, &id, &late).await;
            return SubscriptionResult {
                success: false,
                subscription: self.history_entry(&id).map(|stats| stats.info.clone()),
                relay_results,
                error: Some(SubscriptionError::new(
                    SubscriptionErrorKind::Cancelled,
                    format!("subscription {} ended before activation completed", id),
                )),
            };
        };

        for result in &relay_results {
            if result.success {
                sub.accepted.insert(result.relay_url.clone());
                if let Some(status) = sub.relay_status.get_mut(&result.relay_url)
                    && status.state == RelaySubscriptionState::Pending
                {
                    status.state = RelaySubscriptionState::Active;
                }
            } else {
                sub.set_relay_state(&result.relay_url, RelaySubscriptionState::Error);
            }
        }

        if sub.accepted.is_empty() {
            let error = SubscriptionError::new(
                SubscriptionErrorKind::TotalRelayFailure,
                format!("REQ failed on all {} relays", relay_results.len()),
            );
            warn!("Subscription {} failed: {}", id, error.message);
            self.fail(&id, error.clone());
            return SubscriptionResult {
                success: false,
                subscription: self.history_entry(&id).map(|stats| stats.info.clone()),
                relay_results,
                error: Some(error),
            };
        }

        let failed = relay_results.iter().filter(|r| !r.success).count();
        if failed > 0 {
            warn!(
                "Subscription {} active on {}/{} relays",
                id,
                relay_results.len() - failed,
                relay_results.len()
            );
        }

        sub.transition(SubscriptionState::Active);
        if sub.eose_complete() && sub.transition(SubscriptionState::Eose) {
            sub.deadline = None;
        }
        SubscriptionResult::ok(sub.info(), relay_results)
    }

    /// Close a subscription. Returns false if it was not active.
    pub async fn close(&mut self, id: &str, reason: Option<&str>) -> bool {
        let Some(mut sub) = self.active.remove(id) else {
            return false;
        };

        let targets = holding_relays(&sub);
        sub.transition(SubscriptionState::Closed);
        sub.listeners.notify_close(id, reason);
        info!("Closed subscription {} ({})", id, reason.unwrap_or("no reason"));
        self.retire(sub);

        send_close(&self.pool, id, &targets).await;
        true
    }

    /// Close every active subscription. Returns how many were closed.
    pub async fn close_all(&mut self, reason: Option<&str>) -> usize {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        let mut closed = 0;
        for id in ids {
            if self.close(&id, reason).await {
                closed += 1;
            }
        }
        closed
    }

    /// Route one parsed frame.
    pub fn handle_relay_message(&mut self, relay_url: &str, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                self.handle_relay_events(relay_url, &subscription_id, std::slice::from_ref(&event));
            }
            RelayMessage::Eose { subscription_id } => {
                self.mark_eose(&subscription_id, relay_url);
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => self.handle_relay_closed(relay_url, &subscription_id, &message),
            RelayMessage::Notice { message } => {
                debug!("NOTICE from {}: {}", relay_url, message);
            }
            RelayMessage::Ok { event_id, .. } => {
                debug!("Ignoring OK for {} from {}", event_id, relay_url);
            }
        }
    }

    /// Parse and route one text frame. Malformed frames are logged and dropped.
    pub fn handle_relay_frame(&mut self, relay_url: &str, text: &str) {
        match RelayMessage::from_json(text) {
            Ok(message) => self.handle_relay_message(relay_url, message),
            Err(e) => warn!("Ignoring malformed frame from {}: {}", relay_url, e),
        }
    }

    /// Deliver events that arrived from `relay_url`. Frames from relays not
    /// assigned to the subscription are ignored.
    pub fn handle_relay_events(
        &mut self,
        relay_url: &str,
        subscription_id: &str,
        events: &[Event],
    ) -> usize {
        let now = self.clock.unix_timestamp();
        let Some(sub) = self.active.get_mut(subscription_id) else {
            debug!("Event for unknown subscription {} from {}", subscription_id, relay_url);
            return 0;
        };
        match sub.relay_status.get(relay_url) {
            Some(status) if status.state != RelaySubscriptionState::Error => {}
            _ => {
                debug!(
                    "Ignoring event for {} from unassigned relay {}",
                    subscription_id, relay_url
                );
                return 0;
            }
        }
        sub.deliver(events, now)
    }

    /// Deliver one event. Returns true if it was new to the subscription.
    pub fn handle_event(&mut self, subscription_id: &str, event: &Event) -> bool {
        self.handle_event_batch(subscription_id, std::slice::from_ref(event)) == 1
    }

    /// Deliver many events with one registry lookup. Returns the number of
    /// fresh events.
    pub fn handle_event_batch(&mut self, subscription_id: &str, events: &[Event]) -> usize {
        let now = self.clock.unix_timestamp();
        match self.active.get_mut(subscription_id) {
            Some(sub) => sub.deliver(events, now),
            None => 0,
        }
    }

    /// Record EOSE from `relay_url`. Returns true the first time that relay
    /// reports for this subscription.
    pub fn mark_eose(&mut self, subscription_id: &str, relay_url: &str) -> bool {
        let Some(sub) = self.active.get_mut(subscription_id) else {
            return false;
        };
        let Some(status) = sub.relay_status.get_mut(relay_url) else {
            return false;
        };
        if status.state == RelaySubscriptionState::Error || status.eose_received {
            return false;
        }
        status.eose_received = true;
        sub.listeners.notify_eose(subscription_id, relay_url);

        if sub.state == SubscriptionState::Active
            && sub.eose_complete()
            && sub.transition(SubscriptionState::Eose)
        {
            sub.deadline = None;
            debug!("Subscription {} reached EOSE", subscription_id);
        }
        true
    }

    fn handle_relay_closed(&mut self, relay_url: &str, subscription_id: &str, message: &str) {
        let Some(sub) = self.active.get_mut(subscription_id) else {
            return;
        };
        if !sub.has_relay(relay_url) {
            return;
        }
        warn!(
            "Subscription {} closed by {}: {}",
            subscription_id, relay_url, message
        );
        sub.set_relay_state(relay_url, RelaySubscriptionState::Error);

        if !sub.has_viable_relay() {
            let error = SubscriptionError::new(
                SubscriptionErrorKind::Transport,
                format!("closed by every relay: {}", message),
            );
            self.fail(subscription_id, error);
        } else if sub.state == SubscriptionState::Active
            && sub.eose_complete()
            && sub.transition(SubscriptionState::Eose)
        {
            sub.deadline = None;
        }
    }

    /// Mark `relay_url` disconnected in every subscription using it.
    pub fn handle_relay_disconnection(&mut self, relay_url: &str) -> usize {
        let mut affected = 0;
        let mut lost = Vec::new();
        for sub in self.active.values_mut() {
            let Some(status) = sub.relay_status.get_mut(relay_url) else {
                continue;
            };
            if status.state == RelaySubscriptionState::Error {
                continue;
            }
            status.state = RelaySubscriptionState::Disconnected;
            affected += 1;
            if sub.explicit_relays && !sub.has_viable_relay() {
                lost.push(sub.id.clone());
            }
        }

        for id in lost {
            let error = SubscriptionError::new(
                SubscriptionErrorKind::Transport,
                format!("all assigned relays disconnected (last: {})", relay_url),
            );
            self.fail(&id, error);
        }
        if affected > 0 {
            info!("Relay {} lost, {} subscriptions affected", relay_url, affected);
        }
        affected
    }

    /// Re-send the REQ of every subscription that lost `relay_url`.
    ///
    /// Subscriptions not yet activated get the relay back as pending so
    /// their eventual REQ promotes it.
    pub async fn handle_relay_reconnection(&mut self, relay_url: &str) -> usize {
        for sub in self.active.values_mut().filter(|sub| !sub.activation_started) {
            if let Some(status) = sub.relay_status.get_mut(relay_url)
                && status.state == RelaySubscriptionState::Disconnected
            {
                status.state = RelaySubscriptionState::Pending;
            }
        }

        let resubscribe: Vec<(String, ClientMessage)> = self
            .active
            .values()
            .filter(|sub| sub.activation_started)
            .filter(|sub| {
                sub.relay_status
                    .get(relay_url)
                    .is_some_and(|s| s.state == RelaySubscriptionState::Disconnected)
            })
            .map(|sub| (sub.id.clone(), ClientMessage::req(&sub.id, sub.filters.clone())))
            .collect();
        if resubscribe.is_empty() {
            return 0;
        }

        let results = join_all(
            resubscribe
                .iter()
                .map(|(_, message)| self.pool.send_to(relay_url, message)),
        )
        .await;

        let mut restored = 0;
        for ((id, _), result) in resubscribe.iter().zip(results) {
            let Some(sub) = self.active.get_mut(id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    sub.accepted.insert(relay_url.to_string());
                    sub.set_relay_state(relay_url, RelaySubscriptionState::Active);
                    restored += 1;
                }
                Err(e) => warn!("Resubscribe {} on {} failed: {}", id, relay_url, e),
            }
        }
        info!("Resubscribed {} subscriptions on {}", restored, relay_url);
        restored
    }

    /// Expire subscriptions whose EOSE window has passed. Returns their ids.
    pub async fn check_timeouts(&mut self) -> Vec<String> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .active
            .values()
            .filter(|sub| sub.state != SubscriptionState::Eose)
            .filter(|sub| sub.deadline.is_some_and(|deadline| deadline <= now))
            .map(|sub| sub.id.clone())
            .collect();

        for id in &expired {
            let Some(mut sub) = self.active.remove(id) else {
                continue;
            };
            let targets = holding_relays(&sub);
            let error = SubscriptionError::new(
                SubscriptionErrorKind::Timeout,
                format!(
                    "no EOSE within {:?}",
                    sub.options.timeout.unwrap_or_default()
                ),
            );
            warn!("Subscription {} timed out", id);
            sub.transition(SubscriptionState::Error);
            sub.listeners.notify_error(id, &error);
            sub.listeners.notify_close(id, Some(TIMEOUT_CLOSE_REASON));
            self.retire(sub);
            send_close(&self.pool, id, &targets).await;
        }
        expired
    }

    /// Earliest pending timeout, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active
            .values()
            .filter(|sub| sub.state != SubscriptionState::Eose)
            .filter_map(|sub| sub.deadline)
            .min()
    }

    pub fn add_listener(
        &mut self,
        subscription_id: &str,
        listener: Box<dyn SubscriptionListener>,
    ) -> Option<ListenerId> {
        self.active
            .get_mut(subscription_id)
            .map(|sub| sub.add_listener(listener))
    }

    pub fn remove_listener(&mut self, subscription_id: &str, listener: ListenerId) -> bool {
        self.active
            .get_mut(subscription_id)
            .is_some_and(|sub| sub.listeners.remove(listener))
    }

    /// Live subscriptions in creation order.
    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut subs: Vec<&Subscription> = self.active.values().collect();
        subs.sort_by_key(|sub| sub.seq);
        subs.into_iter().map(Subscription::info).collect()
    }

    /// Look up a live or recently finished subscription.
    pub fn subscription(&self, id: &str) -> Option<SubscriptionInfo> {
        self.subscription_stats(id).map(|stats| stats.info)
    }

    pub fn subscription_stats(&self, id: &str) -> Option<SubscriptionStats> {
        match self.active.get(id) {
            Some(sub) => Some(sub.stats()),
            None => self.history_entry(id).cloned(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn history_entry(&self, id: &str) -> Option<&SubscriptionStats> {
        self.history.iter().rev().find(|stats| stats.info.id == id)
    }

    fn unique_id(&self) -> String {
        loop {
            let id = generate_subscription_id();
            if !self.active.contains_key(&id) && self.history_entry(&id).is_none() {
                return id;
            }
        }
    }

    /// Move a subscription to `Error`, notify and retire it.
    fn fail(&mut self, id: &str, error: SubscriptionError) {
        let Some(mut sub) = self.active.remove(id) else {
            return;
        };
        sub.transition(SubscriptionState::Error);
        sub.listeners.notify_error(id, &error);
        self.retire(sub);
    }

    fn retire(&mut self, sub: Subscription) {
        self.history.push_back(sub.stats());
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
    }
}

/// Best-effort CLOSE; failures only matter to the relay.
async fn send_close(pool: &RelayPool, id: &str, relays: &[String]) {
    if relays.is_empty() {
        return;
    }
    let results = pool.send_to_relays(relays, &ClientMessage::close(id)).await;
    for result in results.iter().filter(|r| !r.success) {
        debug!(
            "CLOSE {} to {} failed: {}",
            id,
            result.relay_url,
            result.error.as_deref().unwrap_or("unknown")
        );
    }
}

/// Relays that should receive a CLOSE for `sub`.
fn holding_relays(sub: &Subscription) -> Vec<String> {
    sub.relays
        .iter()
        .filter(|url| sub.accepted.contains(*url))
        .filter(|url| {
            sub.relay_status
                .get(*url)
                .is_some_and(|status| status.state.is_viable())
        })
        .cloned()
        .collect()
}

fn validate_relays(relays: &[String]) -> Result<Vec<String>, SubscriptionError> {
    if relays.is_empty() {
        return Err(SubscriptionError::validation("explicit relay list is empty"));
    }
    let mut unique: Vec<String> = Vec::with_capacity(relays.len());
    for relay in relays {
        let url = Url::parse(relay)
            .map_err(|e| SubscriptionError::validation(format!("invalid relay {}: {}", relay, e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(SubscriptionError::validation(format!(
                "relay {} must use ws:// or wss://",
                relay
            )));
        }
        if !unique.contains(relay) {
            unique.push(relay.clone());
        }
    }
    Ok(unique)
}
