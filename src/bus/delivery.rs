//! Message metadata, deliveries and declaration options.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::BusResult;

/// Exchange routing behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    Direct,
    /// Binding keys are dot-separated patterns; `*` matches one word, `#` zero or more.
    Topic,
    /// Every bound queue receives every message. The bus itself routes
    /// events through a topic exchange; this kind is for broker adapters
    /// and applications declaring their own exchanges.
    Fanout,
}

/// Topic binding match: `*` matches exactly one word, `#` zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((first, rest)) => match *first {
                "#" => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
                "*" => !key.is_empty() && matches(rest, &key[1..]),
                word => key.first().is_some_and(|k| *k == word) && matches(rest, &key[1..]),
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Queue declaration flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Owned by the declaring connection and removed when it closes.
    pub exclusive: bool,
    /// Removed once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Shared, long-lived queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private queue tied to the declaring connection.
    pub fn private() -> Self {
        Self {
            durable: true,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Message properties carried next to the body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get a header value by name.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    /// Correlation id from the native field, falling back to `header`.
    /// Empty values count as absent.
    pub fn correlation(&self, header: &str) -> Option<&str> {
        self.correlation_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or_else(|| self.header(header).filter(|id| !id.is_empty()))
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> BusResult<()>;

    async fn nack(&self, requeue: bool) -> BusResult<()>;
}

/// A message handed to a consumer.
///
/// It stays unacknowledged, and counts against the consumer's prefetch,
/// until [`Delivery::ack`] or [`Delivery::nack`] is called or it is dropped.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: Properties,
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: Properties,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
            properties,
            body,
            acker,
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Acknowledge the delivery.
    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Reject the delivery, optionally putting it back on its queue.
    pub async fn nack(self, requeue: bool) -> BusResult<()> {
        self.acker.nack(requeue).await
    }

    /// Get the body as a string (if valid UTF-8).
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}
