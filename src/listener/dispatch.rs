//! Per-delivery dispatch into registered handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, warn};

use super::handlers::HandlerRegistry;
use crate::bus::{Channel, Delivery, Properties};
use crate::error::BusError;
use crate::message::{self, Cmd, Event, Query, RequestKind, Topology};

/// Counters describing what the listener did with its deliveries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ListenerStats {
    /// Handler ran and succeeded.
    pub handled: usize,
    /// Handler ran and returned an error.
    pub failed: usize,
    /// No handler registered for the message type.
    pub unhandled: usize,
    /// Body could not be decoded, or a query lacked its reply address.
    pub malformed: usize,
    /// Replies published for queries, including error replies.
    pub replies_sent: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    handled: AtomicUsize,
    failed: AtomicUsize,
    unhandled: AtomicUsize,
    malformed: AtomicUsize,
    replies_sent: AtomicUsize,
}

impl Counters {
    pub fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Queue a consumer task serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Family {
    /// Commands and queries addressed to the application.
    Requests,
    Events,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Requests => "requests",
            Family::Events => "events",
        }
    }
}

/// Reply address fields of a query body, used to recognise queries from
/// senders that set no kind header.
#[derive(Deserialize)]
struct ReplyAddress {
    #[serde(default)]
    correlation_id: String,
    #[serde(default)]
    reply_to: String,
}

/// Routes deliveries of one consumer to handlers.
///
/// Every delivery is acknowledged exactly once after its handler finished,
/// whatever the outcome. Queries get their reply published first.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    pub app_name: String,
    pub handlers: Arc<HandlerRegistry>,
    pub topology: Topology,
    /// Channel replies are published on.
    pub channel: Arc<dyn Channel>,
    pub counters: Arc<Counters>,
}

impl Dispatcher {
    pub async fn dispatch(&self, family: Family, delivery: Delivery) {
        match family {
            Family::Requests => match self.classify(&delivery) {
                RequestKind::Command => self.on_command(&delivery).await,
                RequestKind::Query => self.on_query(&delivery).await,
            },
            Family::Events => self.on_event(&delivery).await,
        }

        if let Err(e) = delivery.ack().await {
            warn!(app = %self.app_name, error = %e, "failed to ack delivery");
        }
    }

    /// The kind header decides. Without it, a reply address in the
    /// properties or the body marks a query.
    fn classify(&self, delivery: &Delivery) -> RequestKind {
        if let Some(kind) = delivery
            .properties
            .header(&self.topology.kind_header)
            .and_then(RequestKind::parse)
        {
            return kind;
        }
        if delivery.properties.reply_to.as_deref().is_some_and(|r| !r.is_empty()) {
            return RequestKind::Query;
        }
        match message::decode::<ReplyAddress>(&delivery.body) {
            Ok(address) if !address.reply_to.is_empty() || !address.correlation_id.is_empty() => {
                RequestKind::Query
            }
            _ => RequestKind::Command,
        }
    }

    async fn on_command(&self, delivery: &Delivery) {
        let cmd: Cmd = match message::decode(&delivery.body) {
            Ok(cmd) => cmd,
            Err(e) => return self.malformed("command", delivery, &e),
        };
        let Some(handler) = self.handlers.command(&cmd.command_type) else {
            return self.unhandled("command", &cmd.command_type);
        };

        let id = cmd.id.clone();
        let command_type = cmd.command_type.clone();
        match handler(cmd).await {
            Ok(()) => {
                Counters::bump(&self.counters.handled);
                debug!(app = %self.app_name, id = %id, command_type = %command_type, "command handled");
            }
            Err(e) => {
                Counters::bump(&self.counters.failed);
                error!(app = %self.app_name, id = %id, command_type = %command_type, error = %e, "command handler failed");
            }
        }
    }

    async fn on_event(&self, delivery: &Delivery) {
        let event: Event = match message::decode(&delivery.body) {
            Ok(event) => event,
            Err(e) => return self.malformed("event", delivery, &e),
        };
        let Some(handler) = self.handlers.event(&event.event_type) else {
            return self.unhandled("event", &event.event_type);
        };

        let id = event.id.clone();
        let event_type = event.event_type.clone();
        match handler(event).await {
            Ok(()) => {
                Counters::bump(&self.counters.handled);
                debug!(app = %self.app_name, id = %id, event_type = %event_type, "event handled");
            }
            Err(e) => {
                Counters::bump(&self.counters.failed);
                error!(app = %self.app_name, id = %id, event_type = %event_type, error = %e, "event handler failed");
            }
        }
    }

    async fn on_query(&self, delivery: &Delivery) {
        let query: Query = match message::decode(&delivery.body) {
            Ok(query) => query,
            Err(e) => return self.malformed("query", delivery, &e),
        };
        let Some(handler) = self.handlers.query(&query.query_type) else {
            // No reply: the caller runs into its deadline.
            return self.unhandled("query", &query.query_type);
        };

        let correlation_id = non_empty(&query.correlation_id)
            .or_else(|| delivery.properties.correlation(&self.topology.correlation_header))
            .map(str::to_string);
        let reply_to = non_empty(&query.reply_to)
            .or_else(|| delivery.properties.reply_to.as_deref().and_then(non_empty))
            .map(str::to_string);
        let (Some(correlation_id), Some(reply_to)) = (correlation_id, reply_to) else {
            let e = BusError::Malformed("query without correlation id or reply address".into());
            return self.malformed("query", delivery, &e);
        };

        let query_type = query.query_type.clone();
        let properties = Properties::new()
            .with_message_type(&query_type)
            .with_correlation_id(&correlation_id)
            .with_header(&self.topology.correlation_header, &correlation_id);

        let (properties, body) = match handler(query).await {
            Ok(body) => {
                Counters::bump(&self.counters.handled);
                (properties, body)
            }
            Err(e) => {
                Counters::bump(&self.counters.failed);
                warn!(app = %self.app_name, query_type = %query_type, correlation_id = %correlation_id, error = %e, "query handler failed, sending error reply");
                (
                    properties.with_header(&self.topology.error_header, e.to_string()),
                    Vec::new(),
                )
            }
        };

        let route = self.topology.reply_route(&reply_to);
        match self
            .channel
            .publish(&route.exchange, &route.routing_key, properties, body)
            .await
        {
            Ok(()) => {
                Counters::bump(&self.counters.replies_sent);
                debug!(app = %self.app_name, query_type = %query_type, correlation_id = %correlation_id, reply_to = %reply_to, "reply sent");
            }
            Err(e) => {
                error!(app = %self.app_name, query_type = %query_type, correlation_id = %correlation_id, error = %e, "failed to publish reply");
            }
        }
    }

    fn malformed(&self, kind: &str, delivery: &Delivery, error: &BusError) {
        Counters::bump(&self.counters.malformed);
        warn!(
            app = %self.app_name,
            kind,
            routing_key = %delivery.routing_key,
            error = %error,
            "malformed delivery dropped"
        );
    }

    fn unhandled(&self, kind: &str, message_type: &str) {
        Counters::bump(&self.counters.unhandled);
        debug!(
            app = %self.app_name,
            kind,
            message_type,
            "no handler registered, delivery dropped"
        );
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}
