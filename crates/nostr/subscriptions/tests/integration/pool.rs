//! Relay connectivity changes seen by live subscriptions

use super::*;
use nostr_subscriptions::testing::{RecordingListener, TEST_PUBKEY, TestSigner, text_note};
use nostr_subscriptions::{
    RelaySubscriptionState, Signer, SubscriptionState, UnsignedEvent,
};
use pretty_assertions::assert_eq;

async fn relay_state(client: &Client, id: &str, relay: &str) -> Option<RelaySubscriptionState> {
    let stats = client.subscription_stats(id).await.unwrap()?;
    stats.relay_states.get(relay).map(|status| status.state)
}

#[tokio::test]
async fn test_disconnect_keeps_subscription_active_on_other_relay() {
    let mut config = test_config(&[RELAY_A, RELAY_B]);
    config.pool.auto_reconnect = false;
    let (client, connector) = start_client_with(config).await;
    let recorder = RecordingListener::new();
    let result = client
        .subscribe_with_listener(kind1(), options(), recorder.clone())
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();

    connector.relay(RELAY_A).drop_connection(Some("restarting"));
    let (c, sid) = (&client, id.as_str());
    eventually("A marked disconnected", move || async move {
        relay_state(c, sid, RELAY_A).await == Some(RelaySubscriptionState::Disconnected)
    })
    .await;

    assert_eq!(info(&client, &id).await.state, SubscriptionState::Active);
    assert_eq!(
        relay_state(&client, &id, RELAY_B).await,
        Some(RelaySubscriptionState::Active)
    );

    connector.relay(RELAY_B).send_event(&id, &text_note(3, "still flowing"));
    eventually("event from B", || {
        let recorder = recorder.clone();
        async move { recorder.events().len() == 1 }
    })
    .await;
    assert!(recorder.errors().is_empty());
}

#[tokio::test]
async fn test_explicit_relay_subscription_fails_when_relay_lost() {
    let mut config = test_config(&[RELAY_A, RELAY_B]);
    config.pool.auto_reconnect = false;
    let (client, connector) = start_client_with(config).await;
    let recorder = RecordingListener::new();
    let result = client
        .subscribe_with_listener(
            kind1(),
            options().relays(vec![RELAY_A.to_string()]),
            recorder.clone(),
        )
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();
    assert!(connector.relay(RELAY_B).sent_of_kind("REQ").is_empty());

    connector.relay(RELAY_A).drop_connection(None);
    eventually("transport error", || {
        let recorder = recorder.clone();
        async move { !recorder.errors().is_empty() }
    })
    .await;

    assert_eq!(info(&client, &id).await.state, SubscriptionState::Error);
    assert!(client.active_subscriptions().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnection_resubscribes() {
    let (client, connector) = start_client(&[RELAY_A, RELAY_B]).await;
    let recorder = RecordingListener::new();
    let result = client
        .subscribe_with_listener(kind1(), options(), recorder.clone())
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();
    let relay_a = connector.relay(RELAY_A);
    relay_a.send_eose(&id);
    connector.relay(RELAY_B).send_eose(&id);
    let (c, sid) = (&client, id.as_str());
    eventually("EOSE", move || async move {
        info(c, sid).await.state == SubscriptionState::Eose
    })
    .await;

    relay_a.clear_sent();
    relay_a.drop_connection(None);
    let watched = relay_a.clone();
    eventually("REQ re-sent to A", move || {
        let relay = watched.clone();
        async move { relay.sent_of_kind("REQ").len() == 1 }
    })
    .await;

    assert_eq!(relay_a.connection_count(), 2);
    assert_eq!(
        relay_state(&client, &id, RELAY_A).await,
        Some(RelaySubscriptionState::Active)
    );
    // EOSE already reached does not regress
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Eose);

    relay_a.send_event(&id, &text_note(11, "after reconnect"));
    eventually("event after reconnect", || {
        let recorder = recorder.clone();
        async move { recorder.events().len() == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_notice_frames_do_not_disturb_subscriptions() {
    let (client, connector) = start_client(&[RELAY_A]).await;
    let result = client.subscribe(kind1(), options()).await.unwrap();
    let id = result.id().unwrap().to_string();

    let relay = connector.relay(RELAY_A);
    relay.push(r#"["NOTICE","rate limited"]"#);
    relay.push("not json");
    relay.send_event(&id, &text_note(1, "after noise"));

    let (c, sid) = (&client, id.as_str());
    eventually("event counted", move || async move {
        info(c, sid).await.event_count == 1
    })
    .await;
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Active);
}

#[tokio::test]
async fn test_publish_signed_event() {
    let (client, connector) = start_client(&[RELAY_A, RELAY_B]).await;
    connector.relay(RELAY_A).auto_ok(true);
    connector.relay(RELAY_B).auto_ok(true);

    let signer = TestSigner::new();
    let pubkey = signer.public_key().await.unwrap();
    assert_eq!(pubkey, TEST_PUBKEY);
    let event = signer
        .sign_event(UnsignedEvent {
            pubkey,
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![vec!["t".to_string(), "nostr".to_string()]],
            content: "published".to_string(),
        })
        .await
        .unwrap();

    let results = client.pool().publish(&event).await;
    assert_eq!(results.len(), 2);
    for (relay, result) in results {
        let confirmation = result.unwrap_or_else(|e| panic!("{} failed: {}", relay, e));
        assert!(confirmation.accepted);
        assert_eq!(confirmation.event_id, event.id);
    }
    assert_eq!(connector.relay(RELAY_A).sent_of_kind("EVENT").len(), 1);

    let stats = client.pool().stats().await;
    assert_eq!(stats.connected_relays, 2);
    assert!(stats.frames_sent >= 2);
}
