//! Queries: request/reply with correlation and timeouts.

use std::sync::Arc;
use std::time::Duration;

use rcbus::{BusError, HandlerError, InMemoryBroker, Listener, Query};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::support::{self, eventually};

#[derive(Debug, Deserialize, PartialEq)]
struct Stock {
    sku: String,
    count: u32,
}

async fn inventory(broker: &InMemoryBroker) -> Listener {
    let mut listener = support::listener(broker, "inventory");
    listener
        .add_query_handler("stock", |query: Query| async move {
            Ok(json!({ "sku": query.data["sku"], "count": 3 }))
        })
        .add_query_handler("missing", |query: Query| async move {
            Err::<Value, _>(HandlerError::NotFound(format!("sku {}", query.data["sku"])))
        })
        .add_query_handler("slow", |_query: Query| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!("late"))
        })
        .add_query_handler("echo", |query: Query| async move { Ok(query.data) });
    listener.listen().await.unwrap();
    listener
}

#[tokio::test]
async fn reply_carries_the_handler_payload() {
    let broker = InMemoryBroker::new();
    let listener = inventory(&broker).await;
    let publisher = support::publisher(&broker, "web", Duration::from_secs(2));

    let body = publisher
        .request_reply("inventory", "stock", json!({ "sku": "A-1" }))
        .await
        .unwrap();

    assert_eq!(body, serde_json::to_vec(&json!({ "sku": "A-1", "count": 3 })).unwrap());
    assert_eq!(publisher.pending_count(), 0);
    assert_eq!(publisher.stats().delivered, 1);
    eventually(|| listener.stats().replies_sent == 1).await;
}

#[tokio::test]
async fn typed_query_decodes_the_reply() {
    let broker = InMemoryBroker::new();
    let _listener = inventory(&broker).await;
    let publisher = support::publisher(&broker, "web", Duration::from_secs(2));

    let stock: Stock = publisher
        .query("inventory", "stock", json!({ "sku": "B-2" }))
        .await
        .unwrap();

    assert_eq!(
        stock,
        Stock {
            sku: "B-2".into(),
            count: 3
        }
    );
}

#[tokio::test]
async fn handler_error_reaches_the_caller() {
    let broker = InMemoryBroker::new();
    let _listener = inventory(&broker).await;
    let publisher = support::publisher(&broker, "web", Duration::from_secs(2));

    let err = publisher
        .request_reply("inventory", "missing", json!({ "sku": 9 }))
        .await
        .unwrap_err();

    match err {
        BusError::Remote { query, message } => {
            assert_eq!(query, "missing");
            assert_eq!(message, "not found: sku 9");
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
    assert_eq!(publisher.pending_count(), 0);
}

#[tokio::test]
async fn unanswered_query_times_out_no_earlier_than_the_timeout() {
    let broker = InMemoryBroker::new();
    let publisher = support::publisher(&broker, "web", Duration::from_millis(300));
    publisher.start().await.unwrap();

    let started = Instant::now();
    let err = publisher
        .request_reply("nobody", "stock", json!({}))
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected a timeout, got {:?}", err);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(publisher.pending_count(), 0);
    assert_eq!(publisher.stats().expired, 1);
}

#[tokio::test]
async fn query_without_handler_times_out() {
    let broker = InMemoryBroker::new();
    let listener = inventory(&broker).await;
    let publisher = support::publisher(&broker, "web", Duration::from_millis(300));

    let err = publisher
        .request_reply("inventory", "price", json!({}))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(listener.stats().unhandled, 1);
    assert_eq!(publisher.pending_count(), 0);
}

#[tokio::test]
async fn late_reply_is_dropped_after_the_timeout() {
    let broker = InMemoryBroker::new();
    let listener = inventory(&broker).await;
    let publisher = support::publisher(&broker, "web", Duration::from_millis(50));

    let err = publisher
        .request_reply("inventory", "slow", json!({}))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    eventually(|| listener.stats().replies_sent == 1).await;
    eventually(|| publisher.stats().unmatched == 1).await;
    assert_eq!(publisher.stats().delivered, 0);
    assert_eq!(publisher.pending_count(), 0);
}

#[tokio::test]
async fn cancelled_query_leaves_nothing_pending() {
    let broker = InMemoryBroker::new();
    let _listener = inventory(&broker).await;
    let publisher = support::publisher(&broker, "web", Duration::from_secs(2));

    let err = publisher
        .request_reply_until(
            "inventory",
            "slow",
            json!({}),
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "expected a cancellation, got {:?}", err);
    assert_eq!(publisher.pending_count(), 0);
    // The reply still arrives, for nobody.
    eventually(|| publisher.stats().unmatched == 1).await;
    assert_eq!(publisher.stats().expired, 0);
}

#[tokio::test]
async fn concurrent_queries_get_their_own_replies() {
    let broker = InMemoryBroker::new();
    let _listener = inventory(&broker).await;
    let publisher = Arc::new(support::publisher(&broker, "web", Duration::from_secs(2)));
    publisher.start().await.unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|n| {
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move {
                let reply: Value = publisher
                    .query("inventory", "echo", json!({ "n": n }))
                    .await
                    .unwrap();
                (n, reply)
            })
        })
        .collect();

    for task in tasks {
        let (n, reply) = task.await.unwrap();
        assert_eq!(reply, json!({ "n": n }));
    }
    assert_eq!(publisher.pending_count(), 0);
    assert_eq!(publisher.stats().delivered, 20);
}
