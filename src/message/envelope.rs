//! Wire-level message shapes.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// A point-to-point instruction addressed to one application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cmd {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Sending application
    pub source: String,
    /// Receiving application
    pub target: String,
    /// Dispatch key within the target's namespace
    #[serde(rename = "type")]
    pub command_type: String,
    pub generation_time: DateTime<Utc>,
    pub data: Value,
}

impl Cmd {
    /// Create a command with a fresh id and the current time.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        command_type: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: new_id(),
            source: source.into(),
            target: target.into(),
            command_type: command_type.into(),
            generation_time: Utc::now(),
            data,
        }
    }

    /// Deserialize the payload into a typed struct.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// A broadcast notification. Every application with a handler for the
/// event type receives its own copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub generation_time: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    /// Create an event with a fresh id and the current time.
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: new_id(),
            source: source.into(),
            event_type: event_type.into(),
            generation_time: Utc::now(),
            data,
        }
    }

    /// Deserialize the payload into a typed struct.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// A request expecting exactly one reply.
///
/// `correlation_id` links the eventual reply to the pending wait;
/// `reply_to` is the identity of the requesting reply router, used as the
/// routing key on the replies exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub query_type: String,
    pub generation_time: DateTime<Utc>,
    pub data: Value,
    /// Empty when the sender only set the delivery's correlation property.
    #[serde(default)]
    pub correlation_id: String,
    /// Empty when the sender only set the delivery's reply-to property.
    #[serde(default)]
    pub reply_to: String,
}

impl Query {
    /// Create a query with a fresh id and the current time.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        query_type: impl Into<String>,
        data: Value,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            source: source.into(),
            target: target.into(),
            query_type: query_type.into(),
            generation_time: Utc::now(),
            data,
            correlation_id: correlation_id.into(),
            reply_to: reply_to.into(),
        }
    }

    /// Deserialize the payload into a typed struct.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}
