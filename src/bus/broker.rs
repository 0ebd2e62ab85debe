//! Broker traits.
//!
//! The listener, publisher and reply router only talk to the broker through
//! these traits. [`super::InMemoryBroker`] implements them in-process; an
//! AMQP adapter implements them over the network.

use std::sync::Arc;

use async_trait::async_trait;

use super::delivery::{Delivery, ExchangeKind, Properties, QueueOptions};
use crate::error::BusResult;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the broker at `url`.
    ///
    /// Fails with [`crate::BusError::ConnectionFailed`] when the broker is
    /// unreachable.
    async fn connect(&self, url: &str) -> BusResult<Arc<dyn Connection>>;
}

/// A live broker connection.
///
/// Closing it removes every exclusive queue it declared.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection.
    async fn channel(&self) -> BusResult<Arc<dyn Channel>>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self) -> BusResult<()>;

    fn is_closed(&self) -> bool;
}

/// A lightweight session on a connection. Declarations are idempotent.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BusResult<()>;

    /// Declare a queue and return its name.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BusResult<String>;

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> BusResult<()>;

    /// Limit unacknowledged deliveries per consumer started after this call.
    /// Zero means unlimited.
    async fn qos(&self, prefetch: u16) -> BusResult<()>;

    /// Publish a message. Unroutable messages are dropped by the broker.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Vec<u8>,
    ) -> BusResult<()>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<Box<dyn Consumer>>;

    async fn close(&self) -> BusResult<()>;
}

/// A stream of deliveries from one queue.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. `None` once the queue is gone.
    async fn next(&mut self) -> Option<Delivery>;
}
