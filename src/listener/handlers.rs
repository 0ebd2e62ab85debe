//! Handler registry keyed by message type.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;

use crate::bus::topic_matches;
use crate::error::HandlerError;
use crate::message::{Cmd, Event, Query};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub(crate) type CommandHandler = Arc<dyn Fn(Cmd) -> BoxFuture<Result<(), HandlerError>> + Send + Sync>;
pub(crate) type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<Result<(), HandlerError>> + Send + Sync>;
/// Query handlers resolve to the JSON-encoded reply body.
pub(crate) type QueryHandler =
    Arc<dyn Fn(Query) -> BoxFuture<Result<Vec<u8>, HandlerError>> + Send + Sync>;

/// Handlers of one listener, one map per message pattern.
#[derive(Clone, Default)]
pub(crate) struct HandlerRegistry {
    commands: HashMap<String, CommandHandler>,
    events: HashMap<String, EventHandler>,
    queries: HashMap<String, QueryHandler>,
}

impl HandlerRegistry {
    pub fn add_command<F, Fut>(&mut self, command_type: &str, handler: F)
    where
        F: Fn(Cmd) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.commands.insert(
            command_type.to_string(),
            Arc::new(move |cmd: Cmd| -> BoxFuture<Result<(), HandlerError>> {
                Box::pin(handler(cmd))
            }),
        );
    }

    pub fn add_event<F, Fut>(&mut self, event_type: &str, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.events.insert(
            event_type.to_string(),
            Arc::new(move |event: Event| -> BoxFuture<Result<(), HandlerError>> {
                Box::pin(handler(event))
            }),
        );
    }

    pub fn add_query<F, Fut, R>(&mut self, query_type: &str, handler: F)
    where
        F: Fn(Query) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize,
    {
        self.queries.insert(
            query_type.to_string(),
            Arc::new(move |query: Query| -> BoxFuture<Result<Vec<u8>, HandlerError>> {
                let reply = handler(query);
                Box::pin(async move {
                    let value = reply.await?;
                    serde_json::to_vec(&value).map_err(|e| HandlerError::EncodeFailed(e.to_string()))
                })
            }),
        );
    }

    pub fn command(&self, command_type: &str) -> Option<CommandHandler> {
        self.commands.get(command_type).cloned()
    }

    /// Handler for `event_type`. An exact registration wins, otherwise the
    /// first matching wildcard pattern (`*`, `#`) in sorted order.
    pub fn event(&self, event_type: &str) -> Option<EventHandler> {
        if let Some(handler) = self.events.get(event_type) {
            return Some(Arc::clone(handler));
        }
        self.event_types()
            .into_iter()
            .find(|pattern| topic_matches(pattern, event_type))
            .and_then(|pattern| self.events.get(&pattern).cloned())
    }

    pub fn query(&self, query_type: &str) -> Option<QueryHandler> {
        self.queries.get(query_type).cloned()
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn has_queries(&self) -> bool {
        !self.queries.is_empty()
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.events.keys().cloned().collect();
        types.sort();
        types
    }
}
