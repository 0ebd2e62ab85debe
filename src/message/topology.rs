//! Exchange, queue and header naming shared by publishers and listeners.

use serde::{Deserialize, Serialize};

use crate::bus::ExchangeKind;

/// Where a message is published: exchange plus routing key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

/// Which request pattern a message on the direct exchange belongs to.
///
/// Commands and queries share one routing key per application, so the
/// kind header tells them apart on the receiving side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Command,
    Query,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Command => "command",
            RequestKind::Query => "query",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "command" => Some(RequestKind::Command),
            "query" => Some(RequestKind::Query),
            _ => None,
        }
    }
}

/// Naming conventions of the broker-side contract.
///
/// Both sides of a conversation must use the same topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    /// Direct exchange for commands and queries, keyed by target application
    pub direct: String,
    /// Topic exchange for events, keyed by event type
    pub events: String,
    /// Direct exchange for replies, keyed by router identity
    pub replies: String,
    /// Header carrying the correlation id when the native field is unavailable
    pub correlation_header: String,
    /// Header carrying a query handler's error text on a reply
    pub error_header: String,
    /// Header carrying the [`RequestKind`] of a message on the direct exchange
    pub kind_header: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            direct: "rcbus.direct".to_string(),
            events: "rcbus.events".to_string(),
            replies: "rcbus.replies".to_string(),
            correlation_header: "x-correlation-id".to_string(),
            error_header: "x-rcbus-error".to_string(),
            kind_header: "x-rcbus-kind".to_string(),
        }
    }
}

impl Topology {
    /// All exchanges with their kinds, in declaration order.
    pub fn exchanges(&self) -> [(&str, ExchangeKind); 3] {
        [
            (self.direct.as_str(), ExchangeKind::Direct),
            (self.events.as_str(), ExchangeKind::Topic),
            (self.replies.as_str(), ExchangeKind::Direct),
        ]
    }

    pub fn command_route(&self, target: &str) -> Route {
        self.request_route(target)
    }

    /// Queries travel exactly like commands.
    pub fn query_route(&self, target: &str) -> Route {
        self.request_route(target)
    }

    pub fn event_route(&self, event_type: &str) -> Route {
        Route {
            exchange: self.events.clone(),
            routing_key: event_type.to_string(),
        }
    }

    pub fn reply_route(&self, reply_to: &str) -> Route {
        Route {
            exchange: self.replies.clone(),
            routing_key: reply_to.to_string(),
        }
    }

    /// Queue consumed by an application's command and query handlers.
    /// Shared by every instance of the application.
    pub fn request_queue(&self, app_name: &str) -> String {
        format!("{}.requests", app_name)
    }

    /// Queue consumed by one listener instance's event handlers.
    pub fn event_queue(&self, app_name: &str, instance: &str) -> String {
        format!("{}.events.{}", app_name, instance)
    }

    fn request_route(&self, target: &str) -> Route {
        Route {
            exchange: self.direct.clone(),
            routing_key: target.to_string(),
        }
    }
}
