//! Commands: point-to-point delivery to one application.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use rcbus::{Cmd, InMemoryBroker};
use serde_json::json;
use tokio::sync::mpsc;

use crate::support::{self, assert_quiet, eventually, next};

fn recording(listener: &mut rcbus::Listener, command_type: &str) -> mpsc::UnboundedReceiver<Cmd> {
    let (tx, rx) = mpsc::unbounded_channel();
    listener.add_command_handler(command_type, move |cmd| {
        let _ = tx.send(cmd);
        async { Ok(()) }
    });
    rx
}

#[tokio::test]
async fn two_commands_reach_the_target_app() {
    let broker = InMemoryBroker::new();
    let mut listener = support::listener(&broker, "app");
    let mut received = recording(&mut listener, "app.cmd");
    listener.listen().await.unwrap();
    let publisher = support::publisher(&broker, "sender", Duration::from_secs(1));

    let first = publisher
        .send_cmd("app", "app.cmd", json!({ "data": "data" }))
        .await
        .unwrap();
    let second = publisher
        .send_cmd("app", "app.cmd", json!({ "data": "data" }))
        .await
        .unwrap();
    assert_ne!(first, second);

    for expected_id in [first, second] {
        let cmd = next(&mut received).await;
        assert_eq!(cmd.id, expected_id);
        assert_eq!(cmd.source, "sender");
        assert_eq!(cmd.target, "app");
        assert_eq!(cmd.command_type, "app.cmd");
        assert_eq!(cmd.data, json!({ "data": "data" }));
        let age = Utc::now() - cmd.generation_time;
        assert!(age.num_seconds().abs() <= 5, "generation time off by {}", age);
    }

    eventually(|| listener.stats().handled == 2).await;
    listener.stop().await.unwrap();
    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn command_only_reaches_its_target() {
    let broker = InMemoryBroker::new();
    let mut billing = support::listener(&broker, "billing");
    let mut billing_rx = recording(&mut billing, "charge");
    let mut shipping = support::listener(&broker, "shipping");
    let mut shipping_rx = recording(&mut shipping, "charge");
    billing.listen().await.unwrap();
    shipping.listen().await.unwrap();
    let publisher = support::publisher(&broker, "web", Duration::from_secs(1));

    let id = publisher.send_cmd("billing", "charge", json!({ "amount": 10 })).await.unwrap();

    assert_eq!(next(&mut billing_rx).await.id, id);
    assert_quiet(&mut shipping_rx, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn instances_of_one_app_share_the_commands() {
    let broker = InMemoryBroker::new();
    let (tx, mut received) = mpsc::unbounded_channel();
    let mut instances = Vec::new();
    for _ in 0..2 {
        let mut listener = support::listener(&broker, "worker");
        let tx = tx.clone();
        listener.add_command_handler("job", move |cmd| {
            let _ = tx.send(cmd.id);
            async { Ok(()) }
        });
        listener.listen().await.unwrap();
        instances.push(listener);
    }
    assert_eq!(broker.consumer_count("worker.requests"), 2);

    let publisher = support::publisher(&broker, "web", Duration::from_secs(1));
    let mut sent = HashSet::new();
    for n in 0..10 {
        sent.insert(publisher.send_cmd("worker", "job", json!({ "n": n })).await.unwrap());
    }

    let mut seen = HashSet::new();
    for _ in 0..10 {
        assert!(seen.insert(next(&mut received).await), "command delivered twice");
    }
    assert_eq!(seen, sent);
    assert_quiet(&mut received, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn commands_and_queries_of_one_type_share_the_app_queue() {
    let broker = InMemoryBroker::new();
    let mut listener = support::listener(&broker, "inventory");
    let mut commands = recording(&mut listener, "stock");
    listener.add_query_handler("stock", |_query| async { Ok(json!({ "count": 3 })) });
    listener.listen().await.unwrap();
    assert_eq!(
        broker.bindings("inventory.requests"),
        vec![("rcbus.direct".to_string(), "inventory".to_string())]
    );
    let publisher = support::publisher(&broker, "web", Duration::from_secs(2));

    let id = publisher.send_cmd("inventory", "stock", json!({ "count": 4 })).await.unwrap();
    let reply: serde_json::Value = publisher.query("inventory", "stock", json!({})).await.unwrap();

    assert_eq!(next(&mut commands).await.id, id);
    assert_eq!(reply, json!({ "count": 3 }));
    assert_quiet(&mut commands, Duration::from_millis(100)).await;
    eventually(|| listener.stats().handled == 2).await;
    let stats = listener.stats();
    assert_eq!(stats.unhandled, 0);
    assert_eq!(stats.replies_sent, 1);
}

#[tokio::test]
async fn failing_handler_does_not_block_the_queue() {
    let broker = InMemoryBroker::new();
    let mut listener = support::listener(&broker, "app");
    let (tx, mut received) = mpsc::unbounded_channel();
    listener.add_command_handler("flaky", move |cmd| {
        let _ = tx.send(cmd.data.clone());
        async move {
            if cmd.data["fail"] == json!(true) {
                Err(rcbus::HandlerError::Rejected("asked to fail".into()))
            } else {
                Ok(())
            }
        }
    });
    listener.listen().await.unwrap();
    let publisher = support::publisher(&broker, "web", Duration::from_secs(1));

    publisher.send_cmd("app", "flaky", json!({ "fail": true })).await.unwrap();
    publisher.send_cmd("app", "flaky", json!({ "fail": false })).await.unwrap();

    assert_eq!(next(&mut received).await, json!({ "fail": true }));
    assert_eq!(next(&mut received).await, json!({ "fail": false }));
    eventually(|| listener.stats().handled == 1 && listener.stats().failed == 1).await;
    eventually(|| broker.acknowledged_count() == 2).await;
    assert_eq!(broker.queue_depth("app.requests"), Some(0));
}
