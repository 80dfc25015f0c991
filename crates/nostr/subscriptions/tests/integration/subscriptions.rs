//! Subscription lifecycle through the client

use super::*;
use nostr_subscriptions::testing::{RecordingListener, text_note};
use nostr_subscriptions::{
    SubscriptionErrorKind, SubscriptionNotification, SubscriptionState, on_event,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

#[tokio::test]
async fn test_subscribe_returns_quickly_with_short_id() {
    let (client, connector) = start_client(&[RELAY_A, RELAY_B]).await;

    let started = Instant::now();
    let result = client.subscribe(kind1(), options()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));

    assert!(result.success, "{:?}", result.error);
    let id = result.id().unwrap().to_string();
    assert_eq!(id.len(), 16);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

    for relay in [RELAY_A, RELAY_B] {
        assert_eq!(
            connector.relay(relay).sent_of_kind("REQ"),
            vec![json!(["REQ", id, {"kinds": [1], "limit": 50}])]
        );
    }
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Active);
}

#[tokio::test]
async fn test_pending_active_eose_across_two_relays() {
    let (client, connector) = start_client(&[RELAY_A, RELAY_B]).await;
    let recorder = RecordingListener::new();

    let result = client
        .subscribe_with_listener(kind1(), options().deferred(), recorder.clone())
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();
    assert_eq!(result.subscription.unwrap().state, SubscriptionState::Pending);
    assert!(connector.relay(RELAY_A).sent().is_empty());

    let activated = client.activate(&id).await.unwrap();
    assert!(activated.success);
    assert_eq!(activated.relay_results.len(), 2);
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Active);

    connector.relay(RELAY_A).send_eose(&id);
    eventually("EOSE from A", || {
        let recorder = recorder.clone();
        async move { recorder.eose_relays().len() == 1 }
    })
    .await;
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Active);

    connector.relay(RELAY_B).send_eose(&id);
    let (c, sid) = (&client, id.as_str());
    eventually("aggregate EOSE", move || async move {
        info(c, sid).await.state == SubscriptionState::Eose
    })
    .await;
    assert_eq!(
        recorder.eose_relays(),
        vec![RELAY_A.to_string(), RELAY_B.to_string()]
    );

    let stats = client.subscription_stats(&id).await.unwrap().unwrap();
    assert_eq!(stats.eose_count, 2);
    assert_eq!(stats.accepted_relays, 2);
}

#[tokio::test]
async fn test_duplicate_event_from_two_relays_delivered_once() {
    let (client, connector) = start_client(&[RELAY_A, RELAY_B]).await;
    let recorder = RecordingListener::new();
    let result = client
        .subscribe_with_listener(kind1(), options(), recorder.clone())
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();

    let note = text_note(7, "seen twice");
    connector.relay(RELAY_A).send_event(&id, &note);
    connector.relay(RELAY_B).send_event(&id, &note);
    connector.relay(RELAY_B).send_event(&id, &text_note(8, "only on B"));

    eventually("both distinct events", || {
        let recorder = recorder.clone();
        async move { recorder.events().len() >= 2 }
    })
    .await;
    // let any straggler duplicate reach the coordinator
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        recorder.event_ids(),
        vec![format!("{:064x}", 7), format!("{:064x}", 8)]
    );
    assert_eq!(info(&client, &id).await.event_count, 2);
}

#[tokio::test]
async fn test_channel_subscription_receives_notifications() {
    let (client, connector) = start_client(&[RELAY_A]).await;
    let (result, mut notifications) = client.subscribe_channel(kind1(), options()).await.unwrap();
    let id = result.id().unwrap().to_string();

    connector.relay(RELAY_A).send_event(&id, &text_note(1, "hello"));
    connector.relay(RELAY_A).send_eose(&id);

    match notifications.recv().await {
        Some(SubscriptionNotification::Event { event, subscription_id }) => {
            assert_eq!(subscription_id, id);
            assert_eq!(event.content, "hello");
        }
        other => panic!("expected event, got {:?}", other),
    }
    match notifications.recv().await {
        Some(SubscriptionNotification::Eose { relay_url, .. }) => assert_eq!(relay_url, RELAY_A),
        other => panic!("expected EOSE, got {:?}", other),
    }

    client.close(&id, Some("done")).await.unwrap();
    match notifications.recv().await {
        Some(SubscriptionNotification::Closed { reason, .. }) => {
            assert_eq!(reason.as_deref(), Some("done"))
        }
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (client, connector) = start_client(&[RELAY_A, RELAY_B]).await;
    let recorder = RecordingListener::new();
    let result = client
        .subscribe_with_listener(kind1(), options(), recorder.clone())
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();

    assert!(client.close(&id, None).await.unwrap());
    assert!(!client.close(&id, None).await.unwrap());
    assert!(!client.close("0000000000000000", None).await.unwrap());

    for relay in [RELAY_A, RELAY_B] {
        assert_eq!(
            connector.relay(relay).sent_of_kind("CLOSE"),
            vec![json!(["CLOSE", id])]
        );
    }
    assert_eq!(recorder.close_reasons().len(), 1);
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Closed);
    assert!(client.active_subscriptions().await.unwrap().is_empty());

    // frames for a closed subscription go nowhere
    connector.relay(RELAY_A).send_event(&id, &text_note(1, "late"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn test_close_all_closes_every_subscription() {
    let (client, connector) = start_client(&[RELAY_A]).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        let result = client.subscribe(kind1(), options()).await.unwrap();
        ids.push(result.id().unwrap().to_string());
    }

    let listed: Vec<String> = client
        .active_subscriptions()
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.id)
        .collect();
    assert_eq!(listed, ids);

    assert_eq!(client.close_all().await.unwrap(), 3);
    assert!(client.active_subscriptions().await.unwrap().is_empty());
    assert_eq!(connector.relay(RELAY_A).sent_of_kind("CLOSE").len(), 3);
    assert_eq!(client.close_all().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_without_eose() {
    let (client, connector) = start_client(&[RELAY_A]).await;
    let recorder = RecordingListener::new();
    let result = client
        .subscribe_with_listener(
            kind1(),
            options().timeout(Some(Duration::from_secs(2))),
            recorder.clone(),
        )
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();

    eventually("timeout", || {
        let recorder = recorder.clone();
        async move { !recorder.close_reasons().is_empty() }
    })
    .await;

    assert_eq!(recorder.errors()[0].kind, SubscriptionErrorKind::Timeout);
    assert_eq!(
        recorder.close_reasons(),
        vec![Some("Subscription timeout".to_string())]
    );
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Error);
    assert_eq!(connector.relay(RELAY_A).sent_of_kind("CLOSE").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_eose_before_deadline_keeps_subscription() {
    let (client, connector) = start_client(&[RELAY_A]).await;
    let relay = connector.relay(RELAY_A);
    relay.auto_eose(true);

    let result = client
        .subscribe(kind1(), options().timeout(Some(Duration::from_secs(2))))
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(info(&client, &id).await.state, SubscriptionState::Eose);
    assert!(relay.sent_of_kind("CLOSE").is_empty());
}

#[tokio::test]
async fn test_fifty_event_batch_is_fast() {
    let (client, connector) = start_client(&[RELAY_A]).await;
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let result = client
        .subscribe_with_listener(
            kind1(),
            options(),
            on_event(move |_event: &nostr_subscriptions::Event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    let id = result.id().unwrap().to_string();
    let notes: Vec<_> = (0..50).map(|n| text_note(n, "batch")).collect();

    let relay = connector.relay(RELAY_A);
    let started = Instant::now();
    for note in &notes {
        relay.send_event(&id, note);
    }
    eventually("50 events", || {
        let delivered = delivered.clone();
        async move { delivered.load(Ordering::SeqCst) == 50 }
    })
    .await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(50), "took {:?}", elapsed);
    let per_second = 50.0 / elapsed.as_secs_f64().max(f64::EPSILON);
    assert!(per_second > 100.0);
    assert_eq!(info(&client, &id).await.event_count, 50);
}

#[tokio::test]
async fn test_listener_added_after_subscribe() {
    let (client, connector) = start_client(&[RELAY_A]).await;
    let result = client.subscribe(kind1(), options()).await.unwrap();
    let id = result.id().unwrap().to_string();

    let recorder = RecordingListener::new();
    let listener_id = client
        .add_listener(&id, recorder.clone())
        .await
        .unwrap()
        .unwrap();
    connector.relay(RELAY_A).send_event(&id, &text_note(1, "first"));
    eventually("first event", || {
        let recorder = recorder.clone();
        async move { recorder.events().len() == 1 }
    })
    .await;

    assert!(client.remove_listener(&id, listener_id).await.unwrap());
    connector.relay(RELAY_A).send_event(&id, &text_note(2, "second"));
    let (c, sid) = (&client, id.as_str());
    eventually("second event counted", move || async move {
        info(c, sid).await.event_count == 2
    })
    .await;
    assert_eq!(recorder.events().len(), 1);

    let missing = client
        .add_listener("ffffffffffffffff", RecordingListener::new())
        .await
        .unwrap();
    assert_eq!(missing, None);
}
