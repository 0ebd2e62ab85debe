//! Publisher: sends commands and events, and runs the query round trip.
//!
//! ```text
//!   send_cmd ───────► direct exchange (key: target, kind: command)
//!   publish_event ──► events exchange (key: event type)
//!   request_reply ──► direct exchange (key: target, kind: query) ···► reply router ──► caller
//! ```
//!
//! A query is registered with the reply router *before* it is published, so
//! a reply can never arrive ahead of its pending entry. Every wait is bounded
//! by the configured reply timeout.
//!
//! ## Example
//!
//! ```ignore
//! let publisher = Publisher::new(PublisherConfig::new("amqp://localhost"), "web", connector);
//! publisher.start().await?;
//!
//! publisher.send_cmd("inventory", "reserve", json!({ "sku": "A-1" })).await?;
//! publisher.publish_event("orderPlaced", json!({ "order": 7 })).await?;
//!
//! let stock: Stock = publisher.query("inventory", "stock", json!({ "sku": "A-1" })).await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Channel, Connection, Connector, Properties};
use crate::config::PublisherConfig;
use crate::error::{BusError, BusResult};
use crate::message::{self, Cmd, Event, Query, RequestKind, Route};
use crate::router::{ReplyRouter, RouterStats};
use crate::telemetry;

struct Session {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
}

/// Forgets a pending query when the waiting future is dropped early.
struct PendingGuard<'a> {
    router: &'a ReplyRouter,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // No-op once the entry was delivered, expired or forgotten.
        if self.router.forget(&self.correlation_id) {
            debug!(correlation_id = %self.correlation_id, "abandoned query forgotten");
        }
    }
}

/// Publishes messages on behalf of one application.
pub struct Publisher {
    app_name: String,
    config: PublisherConfig,
    connector: Arc<dyn Connector>,
    router: ReplyRouter,
    session: Mutex<Option<Session>>,
}

impl Publisher {
    /// Create a publisher for `app_name`. Nothing is connected until
    /// [`start`](Self::start) or the first publish.
    pub fn new(
        config: PublisherConfig,
        app_name: impl Into<String>,
        connector: impl Connector + 'static,
    ) -> Self {
        telemetry::init(config.log_level);
        let app_name = app_name.into();
        let router = ReplyRouter::new(
            &app_name,
            config.reply_timeout(),
            config.prefetch,
            config.topology.clone(),
        );

        Self {
            app_name,
            config,
            connector: Arc::new(connector),
            router,
            session: Mutex::new(None),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The reply router serving this publisher's queries.
    pub fn router(&self) -> &ReplyRouter {
        &self.router
    }

    /// Connect, declare the exchanges and start the reply router.
    ///
    /// A running publisher is torn down and reinitialized.
    pub async fn start(&self) -> BusResult<()> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            debug!(app = %self.app_name, "restarting publisher");
            if let Err(e) = self.close(previous).await {
                warn!(app = %self.app_name, error = %e, "failed to close previous session");
            }
        }
        *session = Some(self.open().await?);
        Ok(())
    }

    /// Stop the reply router and close the connection. Safe to call when
    /// not started, and more than once.
    pub async fn stop(&self) -> BusResult<()> {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => {
                self.close(session).await?;
                info!(app = %self.app_name, "publisher stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Send a command to `target`. Returns the command id once the broker
    /// accepted it.
    pub async fn send_cmd<T: Serialize>(
        &self,
        target: &str,
        command_type: &str,
        data: T,
    ) -> BusResult<String> {
        let cmd = Cmd::new(&self.app_name, target, command_type, serde_json::to_value(data)?);
        let properties = Properties::new()
            .with_message_id(&cmd.id)
            .with_message_type(&cmd.command_type)
            .with_header(&self.config.topology.kind_header, RequestKind::Command.as_str());

        self.publish(self.config.topology.command_route(target), properties, message::encode(&cmd)?)
            .await?;
        debug!(app = %self.app_name, id = %cmd.id, target, command_type, "command sent");
        Ok(cmd.id)
    }

    /// Broadcast an event. Returns the event id once the broker accepted it.
    pub async fn publish_event<T: Serialize>(&self, event_type: &str, data: T) -> BusResult<String> {
        let event = Event::new(&self.app_name, event_type, serde_json::to_value(data)?);
        let properties = Properties::new()
            .with_message_id(&event.id)
            .with_message_type(&event.event_type);

        self.publish(self.config.topology.event_route(event_type), properties, message::encode(&event)?)
            .await?;
        debug!(app = %self.app_name, id = %event.id, event_type, "event published");
        Ok(event.id)
    }

    /// Send a query to `target` and wait for the raw reply body.
    ///
    /// Fails with [`BusError::ReplyTimeout`] when no reply arrives within the
    /// reply timeout, and with [`BusError::Remote`] when the remote handler
    /// failed. Dropping the returned future forgets the pending query.
    pub async fn request_reply<T: Serialize>(
        &self,
        target: &str,
        query_type: &str,
        data: T,
    ) -> BusResult<Vec<u8>> {
        self.request_reply_until(target, query_type, data, std::future::pending())
            .await
    }

    /// Like [`request_reply`](Self::request_reply), but gives up with
    /// [`BusError::Cancelled`] as soon as `cancelled` completes.
    pub async fn request_reply_until<T, C>(
        &self,
        target: &str,
        query_type: &str,
        data: T,
        cancelled: C,
    ) -> BusResult<Vec<u8>>
    where
        T: Serialize,
        C: Future<Output = ()>,
    {
        let data = serde_json::to_value(data)?;
        let correlation_id = Uuid::new_v4().to_string();
        let query = Query::new(
            &self.app_name,
            target,
            query_type,
            data,
            &correlation_id,
            self.router.id(),
        );
        let body = message::encode(&query)?;

        let waiter = self.router.register(query_type, &correlation_id)?;
        let _guard = PendingGuard {
            router: &self.router,
            correlation_id: correlation_id.clone(),
        };

        let properties = Properties::new()
            .with_message_id(&query.id)
            .with_message_type(query_type)
            .with_correlation_id(&correlation_id)
            .with_header(&self.config.topology.correlation_header, &correlation_id)
            .with_header(&self.config.topology.kind_header, RequestKind::Query.as_str())
            .with_reply_to(self.router.id());
        // A failed publish drops the guard, which forgets the entry.
        self.publish(self.config.topology.query_route(target), properties, body)
            .await?;
        debug!(app = %self.app_name, target, query_type, correlation_id = %correlation_id, "query sent");

        tokio::pin!(cancelled);
        tokio::select! {
            outcome = waiter.recv() => outcome,
            _ = &mut cancelled => {
                self.router.forget(&correlation_id);
                debug!(app = %self.app_name, query_type, correlation_id = %correlation_id, "query cancelled by caller");
                Err(BusError::Cancelled { query: query_type.to_string() })
            }
        }
    }

    /// Send a query and decode the JSON reply into `R`.
    pub async fn query<T, R>(&self, target: &str, query_type: &str, data: T) -> BusResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let body = self.request_reply(target, query_type, data).await?;
        message::decode(&body)
    }

    /// Number of queries waiting for a reply or their deadline.
    pub fn pending_count(&self) -> usize {
        self.router.pending_count()
    }

    pub fn stats(&self) -> RouterStats {
        self.router.stats()
    }

    async fn publish(&self, route: Route, properties: Properties, body: Vec<u8>) -> BusResult<()> {
        let channel = self.channel().await?;
        channel
            .publish(&route.exchange, &route.routing_key, properties, body)
            .await
    }

    /// The publishing channel, starting the publisher if needed.
    async fn channel(&self) -> BusResult<Arc<dyn Channel>> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            return Ok(Arc::clone(&current.channel));
        }

        debug!(app = %self.app_name, "publisher not started, starting it");
        let opened = self.open().await?;
        let channel = Arc::clone(&opened.channel);
        *session = Some(opened);
        Ok(channel)
    }

    async fn open(&self) -> BusResult<Session> {
        let connection = self.connector.connect(&self.config.url).await?;
        match self.prepare(&connection).await {
            Ok(channel) => {
                info!(app = %self.app_name, router = %self.router.id(), "publisher started");
                Ok(Session { connection, channel })
            }
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(app = %self.app_name, error = %close_err, "failed to close connection after setup error");
                }
                Err(e)
            }
        }
    }

    async fn prepare(&self, connection: &Arc<dyn Connection>) -> BusResult<Arc<dyn Channel>> {
        let channel = connection.channel().await?;
        for (exchange, kind) in self.config.topology.exchanges() {
            channel.declare_exchange(exchange, kind).await?;
        }
        self.router.start(connection).await?;
        Ok(channel)
    }

    async fn close(&self, session: Session) -> BusResult<()> {
        let router = self.router.stop().await;
        let channel = session.channel.close().await;
        let connection = session.connection.close().await;
        router.and(channel).and(connection)
    }
}
