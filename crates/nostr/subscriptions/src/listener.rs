//! Subscription listeners.
//!
//! Listeners run on the coordinator, one call at a time. A panicking listener
//! is logged and kept; returning [`ListenerError::Closed`] detaches it.

use crate::event::Event;
use crate::subscription::SubscriptionError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenerError {
    /// The listener is gone and should be detached
    #[error("listener closed")]
    Closed,

    #[error("listener failed: {0}")]
    Failed(String),
}

/// Receives notifications for one subscription.
pub trait SubscriptionListener: Send {
    fn on_event(&mut self, subscription_id: &str, event: &Event) -> Result<(), ListenerError>;

    /// A relay finished sending stored events. Called once per relay.
    fn on_eose(&mut self, _subscription_id: &str, _relay_url: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_close(&mut self, _subscription_id: &str, _reason: Option<&str>) {}

    fn on_error(&mut self, _subscription_id: &str, _error: &SubscriptionError) {}
}

/// Handle returned by `add_listener`, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Observer list of one subscription.
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: u64,
    entries: Vec<(ListenerId, Box<dyn SubscriptionListener>)>,
}

impl ListenerSet {
    pub fn add(&mut self, listener: Box<dyn SubscriptionListener>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn notify_event(&mut self, subscription_id: &str, event: &Event) {
        self.dispatch(subscription_id, "on_event", |l| l.on_event(subscription_id, event));
    }

    pub fn notify_eose(&mut self, subscription_id: &str, relay_url: &str) {
        self.dispatch(subscription_id, "on_eose", |l| l.on_eose(subscription_id, relay_url));
    }

    pub fn notify_close(&mut self, subscription_id: &str, reason: Option<&str>) {
        self.dispatch(subscription_id, "on_close", |l| {
            l.on_close(subscription_id, reason);
            Ok(())
        });
    }

    pub fn notify_error(&mut self, subscription_id: &str, error: &SubscriptionError) {
        self.dispatch(subscription_id, "on_error", |l| {
            l.on_error(subscription_id, error);
            Ok(())
        });
    }

    fn dispatch<F>(&mut self, subscription_id: &str, hook: &str, mut call: F)
    where
        F: FnMut(&mut dyn SubscriptionListener) -> Result<(), ListenerError>,
    {
        self.entries.retain_mut(|(id, listener)| {
            match catch_unwind(AssertUnwindSafe(|| call(listener.as_mut()))) {
                Ok(Ok(())) => true,
                Ok(Err(ListenerError::Closed)) => false,
                Ok(Err(ListenerError::Failed(e))) => {
                    warn!(
                        "Listener {:?} {} failed for {}: {}",
                        id, hook, subscription_id, e
                    );
                    true
                }
                Err(_) => {
                    warn!("Listener {:?} panicked in {} for {}", id, hook, subscription_id);
                    true
                }
            }
        });
    }
}

/// Listener built from an event callback.
pub struct FnListener<F>(F);

/// Wrap `f` as a listener that only cares about events.
pub fn on_event<F>(f: F) -> FnListener<F>
where
    F: FnMut(&Event) + Send,
{
    FnListener(f)
}

impl<F> SubscriptionListener for FnListener<F>
where
    F: FnMut(&Event) + Send,
{
    fn on_event(&mut self, _subscription_id: &str, event: &Event) -> Result<(), ListenerError> {
        (self.0)(event);
        Ok(())
    }
}

/// Notifications delivered by a [`ChannelListener`].
#[derive(Debug, Clone)]
pub enum SubscriptionNotification {
    Event {
        subscription_id: String,
        event: Event,
    },
    Eose {
        subscription_id: String,
        relay_url: String,
    },
    Closed {
        subscription_id: String,
        reason: Option<String>,
    },
    Error {
        subscription_id: String,
        error: SubscriptionError,
    },
}

/// Forwards every notification into an mpsc channel. Detaches itself once
/// the receiver is dropped.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SubscriptionNotification>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SubscriptionNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, notification: SubscriptionNotification) -> Result<(), ListenerError> {
        self.tx.send(notification).map_err(|_| ListenerError::Closed)
    }
}

impl SubscriptionListener for ChannelListener {
    fn on_event(&mut self, subscription_id: &str, event: &Event) -> Result<(), ListenerError> {
        self.forward(SubscriptionNotification::Event {
            subscription_id: subscription_id.to_string(),
            event: event.clone(),
        })
    }

    fn on_eose(&mut self, subscription_id: &str, relay_url: &str) -> Result<(), ListenerError> {
        self.forward(SubscriptionNotification::Eose {
            subscription_id: subscription_id.to_string(),
            relay_url: relay_url.to_string(),
        })
    }

    fn on_close(&mut self, subscription_id: &str, reason: Option<&str>) {
        let _ = self.forward(SubscriptionNotification::Closed {
            subscription_id: subscription_id.to_string(),
            reason: reason.map(str::to_string),
        });
    }

    fn on_error(&mut self, subscription_id: &str, error: &SubscriptionError) {
        let _ = self.forward(SubscriptionNotification::Error {
            subscription_id: subscription_id.to_string(),
            error: error.clone(),
        });
    }
}
