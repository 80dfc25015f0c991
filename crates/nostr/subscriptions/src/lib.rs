//! Nostr subscription and relay coordination.
//!
//! This crate provides:
//! - Relay connections over a pluggable transport (WebSocket by default)
//! - A relay pool with reconnection and event fan-out
//! - NIP-01 message parsing and filter validation
//! - Subscriptions spanning many relays, with cross-relay deduplication,
//!   EOSE aggregation, per-relay send retries and timeouts
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_subscriptions::{Client, ClientConfig, Filter, SubscriptionNotification};
//!
//! #[tokio::main]
//! async fn main() -> nostr_subscriptions::Result<()> {
//!     let client = Client::new(ClientConfig::from_env());
//!     client.connect().await?;
//!
//!     // Subscribe to kind 1 (text notes)
//!     let filter = Filter::new().kinds(vec![1]).limit(10);
//!     let (result, mut notifications) = client
//!         .subscribe_channel(vec![filter], client.default_options())
//!         .await?;
//!     if !result.success {
//!         eprintln!("subscribe failed: {:?}", result.error);
//!         return Ok(());
//!     }
//!
//!     while let Some(notification) = notifications.recv().await {
//!         match notification {
//!             SubscriptionNotification::Event { event, .. } => {
//!                 println!("Received event: {}", event.id);
//!             }
//!             SubscriptionNotification::Eose { relay_url, .. } => {
//!                 println!("{} sent all stored events", relay_url);
//!             }
//!             _ => break,
//!         }
//!     }
//!
//!     client.shutdown().await
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
mod dedup;
pub mod error;
pub mod event;
pub mod listener;
pub mod manager;
pub mod message;
pub mod pool;
pub mod relay;
pub mod subscription;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod transport;

// Re-export main types
pub use backoff::{ExponentialBackoff, Jitter, RetryPolicy, retry_with_policy};
pub use client::Client;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, DEFAULT_RELAYS};
pub use error::{ClientError, Result};
pub use event::{Event, Signer, SignerError, UnsignedEvent};
pub use listener::{
    ChannelListener, ListenerError, ListenerId, SubscriptionListener, SubscriptionNotification,
    on_event,
};
pub use manager::{ManagerConfig, SubscriptionManager};
pub use message::{ClientMessage, Filter, FilterError, MessageError, RelayMessage};
pub use pool::{ConnectReport, PoolConfig, PoolEvent, PoolStats, RelayPool, RelaySendResult};
pub use relay::{ConnectionState, PublishConfirmation, RelayConfig, RelayConnection, RelayHealth};
pub use subscription::{
    RelayStatus, RelaySubscriptionState, SubscriptionError, SubscriptionErrorKind,
    SubscriptionInfo, SubscriptionOptions, SubscriptionResult, SubscriptionState,
    SubscriptionStats, generate_subscription_id,
};
pub use transport::{Connector, Transport, TransportEvent, WebSocketConnector};
