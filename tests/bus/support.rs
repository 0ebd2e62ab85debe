//! Shared fixtures: configs, bounded waits and recording handlers.

#![allow(dead_code)]

use std::time::Duration;

use rcbus::{InMemoryBroker, Listener, ListenerConfig, LogLevel, Publisher, PublisherConfig};
use tokio::sync::mpsc;

/// Upper bound for anything that is expected to happen.
pub const WAIT: Duration = Duration::from_secs(2);

pub fn listener(broker: &InMemoryBroker, app_name: &str) -> Listener {
    let config = ListenerConfig::new("memory://localhost").with_log_level(LogLevel::Disabled);
    Listener::new(config, app_name, broker.clone())
}

pub fn publisher(broker: &InMemoryBroker, app_name: &str, reply_timeout: Duration) -> Publisher {
    let config = PublisherConfig::new("memory://localhost")
        .with_reply_timeout(reply_timeout)
        .with_log_level(LogLevel::Disabled);
    Publisher::new(config, app_name, broker.clone())
}

/// Next recorded message, failing the test after [`WAIT`].
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("recording channel closed")
}

/// Assert nothing is recorded for `quiet`.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, quiet: Duration) {
    if let Ok(Some(message)) = tokio::time::timeout(quiet, rx.recv()).await {
        panic!("unexpected message: {:?}", message);
    }
}

/// Poll `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
