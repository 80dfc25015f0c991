//! Integration tests for the subscription client
//!
//! These drive a full [`Client`] (coordinator task, relay pool, relay
//! connections) against in-memory relays.

mod error_handling;
mod pool;
mod subscriptions;

use nostr_subscriptions::testing::MockConnector;
use nostr_subscriptions::{
    Client, ClientConfig, Filter, RetryPolicy, SubscriptionInfo, SubscriptionOptions,
};
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::time::timeout;

pub const RELAY_A: &str = "wss://relay-a.example.com";
pub const RELAY_B: &str = "wss://relay-b.example.com";
pub const RELAY_C: &str = "wss://relay-c.example.com";

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn test_config(relays: &[&str]) -> ClientConfig {
    let mut config =
        ClientConfig::default().with_relays(relays.iter().map(|r| r.to_string()).collect());
    config.manager.default_options.retry = RetryPolicy::new(3, Duration::from_millis(10));
    config.pool.reconnect_base_delay = Duration::from_millis(50);
    config
}

/// Connected client over fresh mock relays.
pub async fn start_client(relays: &[&str]) -> (Client, Arc<MockConnector>) {
    start_client_with(test_config(relays)).await
}

pub async fn start_client_with(config: ClientConfig) -> (Client, Arc<MockConnector>) {
    init_tracing();
    let connector = MockConnector::new();
    let client = Client::with_connector(config, connector.clone());
    client.connect().await.unwrap();
    (client, connector)
}

pub fn kind1() -> Vec<Filter> {
    vec![Filter::new().kinds(vec![1]).limit(50)]
}

pub fn options() -> SubscriptionOptions {
    SubscriptionOptions::default().retry(RetryPolicy::new(3, Duration::from_millis(10)))
}

/// Poll `check` until it holds, failing after five (possibly virtual) seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

pub async fn info(client: &Client, id: &str) -> SubscriptionInfo {
    client
        .subscription(id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("subscription {} not found", id))
}
