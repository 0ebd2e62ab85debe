//! Reply router: synchronous-style waits over an asynchronous transport.
//!
//! Each publisher owns one router. The router owns a private reply queue,
//! bound on the replies exchange under the router's identity, and a table of
//! pending queries keyed by correlation id.
//!
//! ```text
//!   request_reply ──register──► PendingTable ◄──expire── Deadline (per entry)
//!        │                           ▲
//!        │ publish query             │ resolve(correlation id)
//!        ▼                           │
//!     broker ──► reply queue ──► consumer task
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let router = ReplyRouter::new("web", Duration::from_secs(5), 15, Topology::default());
//! router.start(&connection).await?;
//!
//! let waiter = router.register("inventory.stock", &correlation_id)?;
//! // publish the query with reply_to = router.id() ...
//! let body = waiter.recv().await?;
//! ```

mod deadline;
mod pending;

pub use deadline::Deadline;
pub use pending::ReplyWaiter;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Channel, Connection, Consumer, Delivery, ExchangeKind, QueueOptions};
use crate::error::BusResult;
use crate::message::Topology;
use pending::{PendingTable, Resolution};

/// Timeouts below this make queries fail spuriously.
pub const MIN_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Counters describing what happened to replies.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouterStats {
    /// Replies handed to a waiting caller.
    pub delivered: usize,
    /// Pending queries failed by their deadline.
    pub expired: usize,
    /// Replies that lost the race against the deadline.
    pub late: usize,
    /// Replies for an unknown correlation id.
    pub unmatched: usize,
    /// Replies without a correlation id.
    pub malformed: usize,
}

struct Inbox {
    channel: Arc<dyn Channel>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Inbox {
    async fn close(self) -> BusResult<()> {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "reply consumer task ended abnormally");
        }
        self.channel.close().await
    }
}

/// Correlates replies with pending queries and bounds every wait.
pub struct ReplyRouter {
    id: String,
    timeout: Duration,
    prefetch: u16,
    topology: Topology,
    pending: Arc<PendingTable>,
    inbox: Mutex<Option<Inbox>>,
}

impl ReplyRouter {
    /// Create a router for `app_name`.
    ///
    /// The identity `"<app_name>.<uuid>"` names the reply queue and is the
    /// reply address embedded in every outgoing query.
    pub fn new(app_name: &str, timeout: Duration, prefetch: u16, topology: Topology) -> Self {
        if timeout < MIN_REPLY_TIMEOUT {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "reply timeout is very short, queries may time out before their replies arrive"
            );
        }

        Self {
            id: format!("{}.{}", app_name, Uuid::new_v4()),
            timeout,
            prefetch,
            topology,
            pending: PendingTable::new(),
            inbox: Mutex::new(None),
        }
    }

    /// Router identity, used as reply address.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Declare the reply queue on `connection` and start consuming it.
    ///
    /// A running router is stopped first, so every call starts from a freshly
    /// declared queue and consumer.
    pub async fn start(&self, connection: &Arc<dyn Connection>) -> BusResult<()> {
        let mut inbox = self.inbox.lock().await;
        if let Some(previous) = inbox.take() {
            previous.close().await?;
        }

        let channel = connection.channel().await?;
        channel
            .declare_exchange(&self.topology.replies, ExchangeKind::Direct)
            .await?;
        let queue = channel
            .declare_queue(&self.id, QueueOptions::private())
            .await?;
        channel
            .bind_queue(&queue, &self.id, &self.topology.replies)
            .await?;
        channel.qos(self.prefetch).await?;
        let consumer = channel.consume(&queue, &self.id).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(route_replies(
            consumer,
            Arc::clone(&self.pending),
            self.topology.clone(),
            shutdown_rx,
        ));

        *inbox = Some(Inbox {
            channel,
            shutdown,
            task,
        });
        info!(router = %self.id, "reply router started");
        Ok(())
    }

    /// Stop consuming replies. Safe to call when not running.
    ///
    /// Pending queries keep their deadlines and still resolve with a timeout.
    pub async fn stop(&self) -> BusResult<()> {
        let inbox = self.inbox.lock().await.take();
        if let Some(inbox) = inbox {
            inbox.close().await?;
            info!(router = %self.id, "reply router stopped");
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inbox.lock().await.is_some()
    }

    /// Register a pending query and arm its deadline.
    ///
    /// Call this before publishing the query so that a fast reply always
    /// finds its entry.
    pub fn register(&self, query_type: &str, correlation_id: &str) -> BusResult<ReplyWaiter> {
        self.pending.register(query_type, correlation_id, self.timeout)
    }

    /// Fail a pending query with a timeout. Returns `false` if it was
    /// already resolved.
    pub fn expire(&self, correlation_id: &str) -> bool {
        self.pending.expire(correlation_id)
    }

    /// Drop a pending query whose caller stopped waiting.
    ///
    /// Returns `false` when the deadline already fired; the deadline then
    /// removes the entry itself.
    pub fn forget(&self, correlation_id: &str) -> bool {
        self.pending.forget(correlation_id)
    }

    /// Number of queries still waiting for a reply or deadline.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> RouterStats {
        self.pending.stats()
    }
}

async fn route_replies(
    mut consumer: Box<dyn Consumer>,
    pending: Arc<PendingTable>,
    topology: Topology,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            delivery = consumer.next() => match delivery {
                Some(delivery) => route_reply(&pending, &topology, delivery).await,
                None => {
                    debug!("reply queue closed");
                    break;
                }
            }
        }
    }
}

async fn route_reply(pending: &PendingTable, topology: &Topology, mut delivery: Delivery) {
    let correlation_id = delivery
        .properties
        .correlation(&topology.correlation_header)
        .map(str::to_string);

    match correlation_id {
        None => {
            pending.note_malformed();
            warn!(
                routing_key = %delivery.routing_key,
                "reply without correlation id dropped"
            );
        }
        Some(correlation_id) => {
            let body = match delivery.properties.header(&topology.error_header) {
                Some(message) => Err(message.to_string()),
                None => Ok(std::mem::take(&mut delivery.body)),
            };

            match pending.resolve(&correlation_id, body) {
                Resolution::Delivered => {
                    debug!(correlation_id = %correlation_id, "reply delivered");
                }
                Resolution::Late => {
                    debug!(correlation_id = %correlation_id, "reply arrived after its deadline, dropped");
                }
                Resolution::Unmatched => {
                    debug!(correlation_id = %correlation_id, "reply for unknown correlation id dropped");
                }
            }
        }
    }

    if let Err(e) = delivery.ack().await {
        warn!(error = %e, "failed to ack reply");
    }
}
