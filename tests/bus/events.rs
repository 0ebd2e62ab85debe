//! Events: broadcast to every interested application.

use std::time::Duration;

use rcbus::{Event, InMemoryBroker, Listener};
use serde_json::json;
use tokio::sync::mpsc;

use crate::support::{self, assert_quiet, eventually, next};

fn recording(listener: &mut Listener, event_type: &str, tx: &mpsc::UnboundedSender<(String, Event)>) {
    let app = listener.app_name().to_string();
    let tx = tx.clone();
    listener.add_event_handler(event_type, move |event| {
        let _ = tx.send((app.clone(), event));
        async { Ok(()) }
    });
}

#[tokio::test]
async fn every_app_gets_its_own_copy() {
    let broker = InMemoryBroker::new();
    let (tx, mut received) = mpsc::unbounded_channel();
    let mut listeners = Vec::new();
    for app in ["billing", "shipping", "analytics"] {
        let mut listener = support::listener(&broker, app);
        recording(&mut listener, "orderPlaced", &tx);
        listener.listen().await.unwrap();
        listeners.push(listener);
    }
    let publisher = support::publisher(&broker, "orders", Duration::from_secs(1));

    let id = publisher
        .publish_event("orderPlaced", json!({ "order": 7 }))
        .await
        .unwrap();

    let mut apps = Vec::new();
    for _ in 0..3 {
        let (app, event) = next(&mut received).await;
        assert_eq!(event.id, id);
        assert_eq!(event.source, "orders");
        assert_eq!(event.event_type, "orderPlaced");
        assert_eq!(event.data, json!({ "order": 7 }));
        apps.push(app);
    }
    apps.sort();
    assert_eq!(apps, vec!["analytics", "billing", "shipping"]);
    assert_quiet(&mut received, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn every_listener_instance_gets_its_own_copy() {
    let broker = InMemoryBroker::new();
    let (tx, mut received) = mpsc::unbounded_channel();
    let mut listeners = Vec::new();
    for _ in 0..2 {
        let mut listener = support::listener(&broker, "billing");
        recording(&mut listener, "orderPlaced", &tx);
        listener.listen().await.unwrap();
        listeners.push(listener);
    }
    let publisher = support::publisher(&broker, "orders", Duration::from_secs(1));

    let id = publisher.publish_event("orderPlaced", json!({})).await.unwrap();

    for _ in 0..2 {
        let (app, event) = next(&mut received).await;
        assert_eq!(app, "billing");
        assert_eq!(event.id, id);
    }
    assert_quiet(&mut received, Duration::from_millis(100)).await;
    for listener in &listeners {
        eventually(|| listener.stats().handled == 1).await;
    }
}

#[tokio::test]
async fn wildcard_subscription_receives_matching_types() {
    let broker = InMemoryBroker::new();
    let (tx, mut received) = mpsc::unbounded_channel();
    let mut listener = support::listener(&broker, "audit");
    recording(&mut listener, "orders.*", &tx);
    listener.listen().await.unwrap();
    let publisher = support::publisher(&broker, "orders", Duration::from_secs(1));

    let placed = publisher.publish_event("orders.placed", json!({})).await.unwrap();
    publisher.publish_event("billing.paid", json!({})).await.unwrap();

    let (_, event) = next(&mut received).await;
    assert_eq!(event.id, placed);
    assert_eq!(event.event_type, "orders.placed");
    assert_quiet(&mut received, Duration::from_millis(100)).await;
    eventually(|| listener.stats().handled == 1).await;
    assert_eq!(listener.stats().unhandled, 0);
}

#[tokio::test]
async fn only_subscribed_event_types_are_delivered() {
    let broker = InMemoryBroker::new();
    let (tx, mut received) = mpsc::unbounded_channel();
    let mut listener = support::listener(&broker, "billing");
    recording(&mut listener, "orderPlaced", &tx);
    recording(&mut listener, "orderCancelled", &tx);
    listener.listen().await.unwrap();
    let publisher = support::publisher(&broker, "orders", Duration::from_secs(1));

    publisher.publish_event("orderShipped", json!({})).await.unwrap();
    let cancelled = publisher.publish_event("orderCancelled", json!({})).await.unwrap();

    let (_, event) = next(&mut received).await;
    assert_eq!(event.id, cancelled);
    assert_eq!(event.event_type, "orderCancelled");
    assert_quiet(&mut received, Duration::from_millis(100)).await;
    assert_eq!(listener.stats().unhandled, 0);
}
