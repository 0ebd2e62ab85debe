//! Start/stop cycles and connection failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rcbus::{BusError, InMemoryBroker, Listener, ListenerConfig};
use serde_json::json;
use tokio::sync::mpsc;

use crate::support::{self, next};

fn echo_listener(broker: &InMemoryBroker) -> (Listener, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut listener = support::listener(broker, "app");
    listener
        .add_command_handler("ping", move |cmd| {
            let _ = tx.send(cmd.id);
            async { Ok(()) }
        })
        .add_query_handler("echo", |query| async move { Ok(query.data) });
    (listener, rx)
}

#[tokio::test]
async fn publisher_survives_restarts() {
    let broker = InMemoryBroker::new();
    let (listener, mut received) = echo_listener(&broker);
    listener.listen().await.unwrap();
    let publisher = support::publisher(&broker, "web", Duration::from_secs(2));

    publisher.stop().await.unwrap();
    publisher.start().await.unwrap();
    publisher.start().await.unwrap();
    publisher.stop().await.unwrap();
    publisher.stop().await.unwrap();
    assert!(!publisher.is_running().await);
    publisher.start().await.unwrap();

    assert_eq!(broker.consumer_count(publisher.router().id()), 1);
    let id = publisher.send_cmd("app", "ping", json!({})).await.unwrap();
    assert_eq!(next(&mut received).await, id);
    let body = publisher
        .request_reply("app", "echo", json!({ "after": "restart" }))
        .await
        .unwrap();
    assert_eq!(body, serde_json::to_vec(&json!({ "after": "restart" })).unwrap());
}

#[tokio::test]
async fn publisher_restarts_after_stop_via_publish() {
    let broker = InMemoryBroker::new();
    let (listener, mut received) = echo_listener(&broker);
    listener.listen().await.unwrap();
    let publisher = support::publisher(&broker, "web", Duration::from_secs(2));

    publisher.start().await.unwrap();
    publisher.stop().await.unwrap();
    let reply: serde_json::Value = publisher.query("app", "echo", json!(1)).await.unwrap();
    assert_eq!(reply, json!(1));
    assert!(publisher.is_running().await);

    let id = publisher.send_cmd("app", "ping", json!({})).await.unwrap();
    assert_eq!(next(&mut received).await, id);
}

#[tokio::test]
async fn listener_survives_restarts() {
    let broker = InMemoryBroker::new();
    let (listener, mut received) = echo_listener(&broker);
    let publisher = support::publisher(&broker, "web", Duration::from_secs(2));

    listener.stop().await.unwrap();
    listener.listen().await.unwrap();
    listener.stop().await.unwrap();
    listener.stop().await.unwrap();
    assert!(!listener.is_listening().await);

    // Queued while nobody listens, picked up after the restart.
    let queued = publisher.send_cmd("app", "ping", json!({})).await.unwrap();
    listener.listen().await.unwrap();
    assert_eq!(next(&mut received).await, queued);

    assert_eq!(broker.consumer_count("app.requests"), 1);
}

#[tokio::test]
async fn stop_waits_for_in_flight_handlers() {
    let broker = InMemoryBroker::new();
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicBool::new(false));
    let mut listener = support::listener(&broker, "app");
    let done = Arc::clone(&finished);
    listener.add_command_handler("work", move |_cmd| {
        let _ = started_tx.send(());
        let done = Arc::clone(&done);
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            done.store(true, Ordering::SeqCst);
            Ok(())
        }
    });
    listener.listen().await.unwrap();
    let publisher = support::publisher(&broker, "web", Duration::from_secs(2));

    publisher.send_cmd("app", "work", json!({})).await.unwrap();
    next(&mut started).await;
    listener.stop().await.unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(broker.acknowledged_count(), 1);
    assert_eq!(listener.stats().handled, 1);
}

#[tokio::test]
async fn unreachable_broker_fails_listen_and_start() {
    let broker = InMemoryBroker::new();
    broker.set_offline(true);
    let (listener, _received) = echo_listener(&broker);
    let publisher = support::publisher(&broker, "web", Duration::from_secs(1));

    assert!(matches!(listener.listen().await, Err(BusError::ConnectionFailed(_))));
    assert!(matches!(publisher.start().await, Err(BusError::ConnectionFailed(_))));
    assert!(matches!(
        publisher.send_cmd("app", "ping", json!({})).await,
        Err(BusError::ConnectionFailed(_))
    ));

    broker.set_offline(false);
    listener.listen().await.unwrap();
    publisher.start().await.unwrap();
}

#[tokio::test]
async fn unsupported_url_is_a_connection_failure() {
    let broker = InMemoryBroker::new();
    let mut listener = Listener::new(ListenerConfig::new("kafka://localhost"), "app", broker);
    listener.add_command_handler("ping", |_cmd| async { Ok(()) });

    assert!(matches!(listener.listen().await, Err(BusError::ConnectionFailed(_))));
}
