//! Validation, relay failures and misbehaving listeners

use super::*;
use nostr_subscriptions::testing::{RecordingListener, text_note};
use nostr_subscriptions::{
    ClientError, Event, ListenerError, RelaySubscriptionState, SubscriptionErrorKind,
    SubscriptionListener, SubscriptionState,
};
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_malformed_json_filters_rejected() {
    let (client, connector) = start_client(&[RELAY_A]).await;

    for bad in [
        json!([1, 2]),
        json!({"kinds": "1"}),
        json!({"authors": ["xyz"]}),
        json!({"limit": -1}),
    ] {
        let result = client.subscribe_json(vec![bad.clone()], options()).await.unwrap();
        assert!(!result.success, "accepted {}", bad);
        let error = result.error.unwrap();
        assert_eq!(error.kind, SubscriptionErrorKind::Validation);
        assert!(!error.retryable);
    }

    assert!(client.active_subscriptions().await.unwrap().is_empty());
    assert!(connector.relay(RELAY_A).sent().is_empty());
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let (client, _connector) = start_client(&[RELAY_A]).await;

    let zero_timeout = client
        .subscribe(kind1(), options().timeout(Some(Duration::ZERO)))
        .await
        .unwrap();
    assert_eq!(zero_timeout.error.unwrap().kind, SubscriptionErrorKind::Validation);

    let no_relays = client
        .subscribe(kind1(), options().relays(vec![]))
        .await
        .unwrap();
    assert_eq!(no_relays.error.unwrap().kind, SubscriptionErrorKind::Validation);

    let bad_url = client
        .subscribe(kind1(), options().relays(vec!["https://relay.example.com".into()]))
        .await
        .unwrap();
    assert_eq!(bad_url.error.unwrap().kind, SubscriptionErrorKind::Validation);
}

#[tokio::test]
async fn test_no_connected_relays() {
    init_tracing();
    let connector = MockConnector::new();
    connector.relay(RELAY_A).fail_connect(true);
    let client = Client::with_connector(test_config(&[RELAY_A]), connector.clone());
    let report = client.connect().await.unwrap();
    assert_eq!(report.failed.len(), 1);

    let result = client.subscribe(kind1(), options()).await.unwrap();
    let error = result.error.unwrap();
    assert_eq!(error.kind, SubscriptionErrorKind::NoRelays);
    assert!(error.retryable);
}

#[tokio::test(start_paused = true)]
async fn test_partial_relay_failure() {
    let (client, connector) = start_client(&[RELAY_A, RELAY_B]).await;
    connector.relay(RELAY_B).fail_all_sends(true);

    let result = client.subscribe(kind1(), options()).await.unwrap();
    assert!(result.success);
    let failures: Vec<_> = result.partial_failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].relay_url, RELAY_B);
    assert_eq!(failures[0].attempts, 4);
    assert_eq!(connector.relay(RELAY_B).send_attempts(), 4);
    let warning = result.warning().unwrap();
    assert_eq!(warning.kind, SubscriptionErrorKind::PartialRelayFailure);
    assert!(!warning.retryable);
    assert!(result.error.is_none());

    let id = result.id().unwrap().to_string();
    let stats = client.subscription_stats(&id).await.unwrap().unwrap();
    assert_eq!(stats.accepted_relays, 1);
    assert_eq!(
        stats.relay_states[RELAY_B].state,
        RelaySubscriptionState::Error
    );

    // the failed relay does not hold back EOSE
    connector.relay(RELAY_A).send_eose(&id);
    let (c, sid) = (&client, id.as_str());
    eventually("EOSE", move || async move {
        info(c, sid).await.state == SubscriptionState::Eose
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_send_failure_recovers() {
    let (client, connector) = start_client(&[RELAY_A]).await;
    connector.relay(RELAY_A).fail_next_sends(2);

    let result = client.subscribe(kind1(), options()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.relay_results[0].attempts, 3);
    assert!(result.partial_failures().next().is_none());
    assert!(result.warning().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_total_relay_failure() {
    let (client, connector) = start_client(&[RELAY_A, RELAY_B]).await;
    connector.relay(RELAY_A).fail_all_sends(true);
    connector.relay(RELAY_B).fail_all_sends(true);
    let recorder = RecordingListener::new();

    let result = client
        .subscribe_with_listener(kind1(), options(), recorder.clone())
        .await
        .unwrap();
    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.kind, SubscriptionErrorKind::TotalRelayFailure);
    assert!(error.retryable);
    assert_eq!(result.relay_results.len(), 2);
    assert_eq!(recorder.errors().len(), 1);
    assert!(recorder.close_reasons().is_empty());

    let id = result.subscription.unwrap().id;
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Error);
}

#[tokio::test]
async fn test_closed_frame_from_relay() {
    let (client, connector) = start_client(&[RELAY_A, RELAY_B]).await;
    let recorder = RecordingListener::new();
    let result = client
        .subscribe_with_listener(kind1(), options(), recorder.clone())
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();

    connector
        .relay(RELAY_A)
        .push_json(json!(["CLOSED", id, "auth-required: sign in"]));
    let (c, sid) = (&client, id.as_str());
    eventually("A in error", move || async move {
        let stats = c.subscription_stats(sid).await.unwrap().unwrap();
        stats.relay_states[RELAY_A].state == RelaySubscriptionState::Error
    })
    .await;
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Active);

    connector
        .relay(RELAY_B)
        .push_json(json!(["CLOSED", id, "error: shutting down"]));
    eventually("subscription failed", || {
        let recorder = recorder.clone();
        async move { !recorder.errors().is_empty() }
    })
    .await;
    assert_eq!(recorder.errors()[0].kind, SubscriptionErrorKind::Transport);
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Error);
}

struct PanickingListener;

impl SubscriptionListener for PanickingListener {
    fn on_event(&mut self, _subscription_id: &str, _event: &Event) -> Result<(), ListenerError> {
        panic!("listener bug");
    }
}

struct FailingListener;

impl SubscriptionListener for FailingListener {
    fn on_event(&mut self, _subscription_id: &str, _event: &Event) -> Result<(), ListenerError> {
        Err(ListenerError::Failed("cannot store event".into()))
    }
}

#[tokio::test]
async fn test_misbehaving_listeners_do_not_block_delivery() {
    let (client, connector) = start_client(&[RELAY_A]).await;
    let result = client
        .subscribe_with_listener(kind1(), options(), PanickingListener)
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();
    client.add_listener(&id, FailingListener).await.unwrap();
    let recorder = RecordingListener::new();
    client.add_listener(&id, recorder.clone()).await.unwrap();

    let relay = connector.relay(RELAY_A);
    relay.send_event(&id, &text_note(1, "one"));
    relay.send_event(&id, &text_note(2, "two"));

    eventually("both events", || {
        let recorder = recorder.clone();
        async move { recorder.events().len() == 2 }
    })
    .await;
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Active);
}

#[tokio::test]
async fn test_calls_after_shutdown_fail() {
    let (client, connector) = start_client(&[RELAY_A]).await;
    let handle = client.clone();
    let result = client.subscribe(kind1(), options()).await.unwrap();
    assert!(result.success);

    client.shutdown().await.unwrap();
    assert_eq!(connector.relay(RELAY_A).sent_of_kind("CLOSE").len(), 1);
    assert!(!connector.relay(RELAY_A).is_connected());

    assert!(matches!(
        handle.subscribe(kind1(), options()).await,
        Err(ClientError::Disposed)
    ));
    assert!(matches!(handle.close_all().await, Err(ClientError::Disposed)));
}
