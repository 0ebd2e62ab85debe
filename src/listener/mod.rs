//! Listener: consumes commands, events and queries for one application.
//!
//! Handlers are registered per message type, then [`Listener::listen`]
//! declares the application's queues and spawns one consumer task per queue:
//!
//! ```text
//!   direct exchange ── key: <app> ─────────► <app>.requests ──────┐
//!   events exchange ── key: <event type> ──► <app>.events.<uuid> ─┴─► Dispatcher ─► handler
//!                                                                           │
//!                                                                           ▼ (queries only)
//!                                                        replies exchange ── key: reply_to
//! ```
//!
//! Commands and queries share the request queue, named after the
//! application, so instances of one application compete for them. Every
//! listener declares its own private event queue, so each one handles its
//! own copy of an event.
//!
//! ## Example
//!
//! ```ignore
//! let mut listener = Listener::new(ListenerConfig::new("amqp://localhost"), "inventory", connector);
//! listener
//!     .add_command_handler("reserve", |cmd| async move {
//!         let input: Reserve = cmd.data_as()?;
//!         reserve(input).await
//!     })
//!     .add_query_handler("stock", |query| async move { Ok(json!({ "count": 3 })) });
//!
//! listener.listen().await?;
//! // ...
//! listener.stop().await?;
//! ```

mod dispatch;
mod handlers;

pub use dispatch::ListenerStats;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Channel, Connection, Connector, Consumer, ExchangeKind, QueueOptions};
use crate::config::ListenerConfig;
use crate::error::{BusResult, HandlerError};
use crate::message::{Cmd, Event, Query};
use crate::telemetry;
use dispatch::{Counters, Dispatcher, Family};
use handlers::HandlerRegistry;

struct Session {
    connection: Arc<dyn Connection>,
    channels: Vec<Arc<dyn Channel>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Consumes the messages addressed to one application.
pub struct Listener {
    app_name: String,
    config: ListenerConfig,
    connector: Arc<dyn Connector>,
    handlers: HandlerRegistry,
    counters: Arc<Counters>,
    session: Mutex<Option<Session>>,
}

impl Listener {
    /// Create a listener for `app_name`. Nothing is connected until
    /// [`listen`](Self::listen).
    pub fn new(
        config: ListenerConfig,
        app_name: impl Into<String>,
        connector: impl Connector + 'static,
    ) -> Self {
        telemetry::init(config.log_level);
        Self {
            app_name: app_name.into(),
            config,
            connector: Arc::new(connector),
            handlers: HandlerRegistry::default(),
            counters: Arc::new(Counters::default()),
            session: Mutex::new(None),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Register the handler for commands of `command_type`.
    ///
    /// Registering the same type again replaces the handler. Handlers added
    /// while listening take effect on the next [`listen`](Self::listen).
    pub fn add_command_handler<F, Fut>(&mut self, command_type: &str, handler: F) -> &mut Self
    where
        F: Fn(Cmd) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handlers.add_command(command_type, handler);
        self
    }

    /// Register the handler for events of `event_type`.
    ///
    /// `event_type` is bound as a topic pattern, so `orders.*` and `orders.#`
    /// subscribe to a family of types. An exact registration takes
    /// precedence over a matching pattern.
    pub fn add_event_handler<F, Fut>(&mut self, event_type: &str, handler: F) -> &mut Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handlers.add_event(event_type, handler);
        self
    }

    /// Register the handler for queries of `query_type`.
    ///
    /// The handler's result is serialized to JSON and sent back as the reply
    /// body. An error is sent back as an error reply.
    pub fn add_query_handler<F, Fut, R>(&mut self, query_type: &str, handler: F) -> &mut Self
    where
        F: Fn(Query) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize,
    {
        self.handlers.add_query(query_type, handler);
        self
    }

    /// Connect, declare the application's queues and start consuming.
    ///
    /// Returns once every consumer is running. Calling it while already
    /// listening does nothing.
    pub async fn listen(&self) -> BusResult<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            debug!(app = %self.app_name, "already listening");
            return Ok(());
        }

        let connection = self.connector.connect(&self.config.url).await?;
        match self.open(&connection).await {
            Ok(opened) => {
                info!(
                    app = %self.app_name,
                    consumers = opened.tasks.len(),
                    "listener started"
                );
                *session = Some(opened);
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(app = %self.app_name, error = %close_err, "failed to close connection after setup error");
                }
                Err(e)
            }
        }
    }

    /// Stop consuming and close the connection. Safe to call when not
    /// listening, and more than once.
    ///
    /// In-flight handlers run to completion and their deliveries are
    /// acknowledged before this returns.
    pub async fn stop(&self) -> BusResult<()> {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            return Ok(());
        };

        let _ = session.shutdown.send(true);
        for task in session.tasks {
            if let Err(e) = task.await {
                warn!(app = %self.app_name, error = %e, "consumer task ended abnormally");
            }
        }

        let mut result = Ok(());
        for channel in session.channels {
            if let Err(e) = channel.close().await {
                warn!(app = %self.app_name, error = %e, "failed to close channel");
                result = Err(e);
            }
        }
        session.connection.close().await?;
        info!(app = %self.app_name, "listener stopped");
        result
    }

    pub async fn is_listening(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub fn stats(&self) -> ListenerStats {
        self.counters.snapshot()
    }

    async fn open(&self, connection: &Arc<dyn Connection>) -> BusResult<Session> {
        let (shutdown, _) = watch::channel(false);
        let handlers = Arc::new(self.handlers.clone());
        let topology = &self.config.topology;
        let mut channels = Vec::new();
        let mut tasks = Vec::new();

        // Commands and queries share one channel, events get their own.
        if handlers.has_commands() || handlers.has_queries() {
            let channel = self.open_channel(connection).await?;
            channels.push(Arc::clone(&channel));

            let queue = topology.request_queue(&self.app_name);
            self.declare(
                &channel,
                &topology.direct,
                ExchangeKind::Direct,
                &queue,
                QueueOptions::durable(),
                &[self.app_name.clone()],
            )
            .await?;
            tasks.push(self.spawn(&channel, &handlers, Family::Requests, &queue, &shutdown).await?);
        }

        if handlers.has_events() {
            let channel = self.open_channel(connection).await?;
            channels.push(Arc::clone(&channel));

            let queue = topology.event_queue(&self.app_name, &Uuid::new_v4().to_string());
            self.declare(
                &channel,
                &topology.events,
                ExchangeKind::Topic,
                &queue,
                QueueOptions::private(),
                &handlers.event_types(),
            )
            .await?;
            tasks.push(self.spawn(&channel, &handlers, Family::Events, &queue, &shutdown).await?);
        }

        if tasks.is_empty() {
            warn!(app = %self.app_name, "no handlers registered, nothing to consume");
        }

        Ok(Session {
            connection: Arc::clone(connection),
            channels,
            shutdown,
            tasks,
        })
    }

    async fn open_channel(&self, connection: &Arc<dyn Connection>) -> BusResult<Arc<dyn Channel>> {
        let channel = connection.channel().await?;
        channel.qos(self.config.prefetch).await?;
        Ok(channel)
    }

    async fn declare(
        &self,
        channel: &Arc<dyn Channel>,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        options: QueueOptions,
        routing_keys: &[String],
    ) -> BusResult<()> {
        channel.declare_exchange(exchange, kind).await?;
        let queue = channel.declare_queue(queue, options).await?;
        for key in routing_keys {
            channel.bind_queue(&queue, key, exchange).await?;
            debug!(app = %self.app_name, queue = %queue, exchange, routing_key = %key, "queue bound");
        }
        Ok(())
    }

    async fn spawn(
        &self,
        channel: &Arc<dyn Channel>,
        handlers: &Arc<HandlerRegistry>,
        family: Family,
        queue: &str,
        shutdown: &watch::Sender<bool>,
    ) -> BusResult<JoinHandle<()>> {
        let consumer_tag = format!("{}.{}", queue, Uuid::new_v4());
        let consumer = channel.consume(queue, &consumer_tag).await?;
        let dispatcher = Dispatcher {
            app_name: self.app_name.clone(),
            handlers: Arc::clone(handlers),
            topology: self.config.topology.clone(),
            channel: Arc::clone(channel),
            counters: Arc::clone(&self.counters),
        };
        debug!(app = %self.app_name, queue, family = family.as_str(), "consumer started");
        Ok(tokio::spawn(consume(consumer, family, dispatcher, shutdown.subscribe())))
    }
}

async fn consume(
    mut consumer: Box<dyn Consumer>,
    family: Family,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            // Also fires when the sender is dropped by a failed setup.
            _ = shutdown.changed() => break,
            delivery = consumer.next() => match delivery {
                Some(delivery) => dispatcher.dispatch(family, delivery).await,
                None => {
                    debug!(app = %dispatcher.app_name, family = family.as_str(), "queue closed");
                    break;
                }
            }
        }
    }
}
