//! In-process broker for testing and single-process deployments.
//!
//! Implements the broker traits with the semantics the bus relies on:
//! - direct, topic and fanout exchanges
//! - durable, exclusive and auto-delete queues
//! - competing consumers on a shared queue
//! - per-consumer prefetch, released on ack/nack
//! - nack with requeue

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};
use uuid::Uuid;

use super::broker::{Channel, Connection, Connector, Consumer};
use super::delivery::{topic_matches, Acknowledger, Delivery, ExchangeKind, Properties, QueueOptions};
use crate::error::{BusError, BusResult};

const SCHEMES: [&str; 3] = ["memory://", "amqp://", "amqps://"];

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: Properties,
    body: Vec<u8>,
    redelivered: bool,
}

type Inbox = Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>;

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    tx: mpsc::UnboundedSender<Message>,
    rx: Inbox,
    depth: Arc<AtomicUsize>,
    consumers: usize,
}

struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    next_connection: AtomicU64,
    offline: AtomicBool,
    published: AtomicUsize,
    acked: AtomicUsize,
    nacked: AtomicUsize,
}

/// In-process broker.
///
/// Cloning yields another handle to the same broker, so a test can hand one
/// clone to a listener, one to a publisher and keep one for inspection.
///
/// ## Example
///
/// ```ignore
/// let broker = InMemoryBroker::new();
/// let mut listener = Listener::new(ListenerConfig::new("memory://local"), "orders", broker.clone());
/// let publisher = Publisher::new(PublisherConfig::new("memory://local"), "web", broker.clone());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create a new empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail, simulating an unreachable broker.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    /// Whether a queue with this name currently exists.
    pub fn has_queue(&self, name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(name)
    }

    /// Number of messages waiting in a queue (not yet handed to a consumer).
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.shared
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.depth.load(Ordering::SeqCst))
    }

    /// Number of active consumers on a queue.
    pub fn consumer_count(&self, name: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.consumers)
    }

    /// All queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(exchange, routing key)` pairs bound to a queue.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.shared
            .state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    /// Total publish calls accepted by the broker.
    pub fn published_count(&self) -> usize {
        self.shared.published.load(Ordering::SeqCst)
    }

    /// Total deliveries acknowledged.
    pub fn acknowledged_count(&self) -> usize {
        self.shared.acked.load(Ordering::SeqCst)
    }

    /// Total deliveries rejected.
    pub fn rejected_count(&self) -> usize {
        self.shared.nacked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, url: &str) -> BusResult<Arc<dyn Connection>> {
        if !SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
            return Err(BusError::ConnectionFailed(format!(
                "unsupported broker url: {}",
                url
            )));
        }
        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionFailed(format!(
                "broker at {} is unreachable",
                url
            )));
        }

        let id = self.shared.next_connection.fetch_add(1, Ordering::SeqCst);
        debug!(connection = id, url, "in-memory connection opened");

        Ok(Arc::new(InMemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

impl Shared {
    fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BusResult<()> {
        let mut state = self.state.lock();
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BusError::Broker(format!(
                "exchange {} already declared as {:?}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    fn declare_queue(&self, connection: u64, name: &str, options: QueueOptions) -> BusResult<String> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };

        let mut state = self.state.lock();
        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != connection) {
                return Err(BusError::Broker(format!(
                    "queue {} is exclusive to another connection",
                    name
                )));
            }
            return Ok(name);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.queues.insert(
            name.clone(),
            QueueState {
                options,
                owner: options.exclusive.then_some(connection),
                tx,
                rx: Arc::new(AsyncMutex::new(rx)),
                depth: Arc::new(AtomicUsize::new(0)),
                consumers: 0,
            },
        );
        Ok(name)
    }

    fn bind(&self, queue: &str, routing_key: &str, exchange: &str) -> BusResult<()> {
        let mut state = self.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Broker(format!("no exchange {}", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Broker(format!("no queue {}", queue)));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.routing_key == routing_key && b.queue == queue);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    fn publish(&self, message: Message) -> BusResult<()> {
        let state = self.state.lock();
        let kind = *state
            .exchanges
            .get(&message.exchange)
            .ok_or_else(|| BusError::Broker(format!("no exchange {}", message.exchange)))?;

        let mut targets: Vec<&str> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == message.exchange) {
            let matched = match kind {
                ExchangeKind::Direct => binding.routing_key == message.routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, &message.routing_key),
                ExchangeKind::Fanout => true,
            };
            if matched && !targets.contains(&binding.queue.as_str()) {
                targets.push(binding.queue.as_str());
            }
        }

        if targets.is_empty() {
            trace!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "unroutable message dropped"
            );
        }

        for name in targets {
            if let Some(queue) = state.queues.get(name) {
                queue.depth.fetch_add(1, Ordering::SeqCst);
                if queue.tx.send(message.clone()).is_err() {
                    queue.depth.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn consume(&self, queue: &str, prefetch: u16) -> BusResult<InMemoryConsumer> {
        let mut state = self.state.lock();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Broker(format!("no queue {}", queue)))?;
        entry.consumers += 1;

        Ok(InMemoryConsumer {
            queue: queue.to_string(),
            rx: Arc::clone(&entry.rx),
            requeue: entry.tx.downgrade(),
            depth: Arc::clone(&entry.depth),
            permits: (prefetch > 0).then(|| Arc::new(Semaphore::new(prefetch as usize))),
            shared: Weak::new(),
        })
    }

    fn remove_queue(state: &mut State, name: &str) {
        state.queues.remove(name);
        state.bindings.retain(|b| b.queue != name);
    }

    /// Drop every exclusive queue owned by a closing connection.
    fn close_connection(&self, connection: u64) {
        let mut state = self.state.lock();
        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            debug!(queue = %name, connection, "exclusive queue removed");
            Self::remove_queue(&mut state, &name);
        }
    }

    fn consumer_gone(&self, queue: &str, rx: &Inbox) {
        let mut state = self.state.lock();
        let Some(entry) = state.queues.get_mut(queue) else {
            return;
        };
        if !Arc::ptr_eq(&entry.rx, rx) {
            return;
        }
        entry.consumers = entry.consumers.saturating_sub(1);
        if entry.consumers == 0 && entry.options.auto_delete {
            debug!(queue, "auto-delete queue removed");
            Self::remove_queue(&mut state, queue);
        }
    }
}

struct InMemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn channel(&self) -> BusResult<Arc<dyn Channel>> {
        if self.is_closed() {
            return Err(BusError::Broker("connection is closed".into()));
        }
        Ok(Arc::new(InMemoryChannel {
            connection: self.id,
            shared: Arc::clone(&self.shared),
            connection_closed: Arc::clone(&self.closed),
            closed: AtomicBool::new(false),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.close_connection(self.id);
        debug!(connection = self.id, "in-memory connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct InMemoryChannel {
    connection: u64,
    shared: Arc<Shared>,
    connection_closed: Arc<AtomicBool>,
    closed: AtomicBool,
    prefetch: AtomicU16,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst) {
            return Err(BusError::Broker("channel is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BusResult<()> {
        self.ensure_open()?;
        self.shared.declare_exchange(name, kind)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BusResult<String> {
        self.ensure_open()?;
        self.shared.declare_queue(self.connection, name, options)
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> BusResult<()> {
        self.ensure_open()?;
        self.shared.bind(queue, routing_key, exchange)
    }

    async fn qos(&self, prefetch: u16) -> BusResult<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Vec<u8>,
    ) -> BusResult<()> {
        self.ensure_open()?;
        self.shared.publish(Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
            redelivered: false,
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<Box<dyn Consumer>> {
        self.ensure_open()?;
        let mut consumer = self
            .shared
            .consume(queue, self.prefetch.load(Ordering::SeqCst))?;
        consumer.shared = Arc::downgrade(&self.shared);
        debug!(queue, consumer_tag, "consumer started");
        Ok(Box::new(consumer))
    }

    async fn close(&self) -> BusResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct InMemoryConsumer {
    queue: String,
    rx: Inbox,
    requeue: mpsc::WeakUnboundedSender<Message>,
    depth: Arc<AtomicUsize>,
    permits: Option<Arc<Semaphore>>,
    shared: Weak<Shared>,
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        let permit = match &self.permits {
            Some(permits) => Some(Arc::clone(permits).acquire_owned().await.ok()?),
            None => None,
        };

        let message = {
            let mut rx = self.rx.lock().await;
            rx.recv().await?
        };
        self.depth.fetch_sub(1, Ordering::SeqCst);

        let acker = InMemoryAcker {
            message: Mutex::new(Some(message.clone())),
            requeue: self.requeue.clone(),
            depth: Arc::clone(&self.depth),
            shared: self.shared.clone(),
            _permit: permit,
        };

        Some(
            Delivery::new(
                message.exchange,
                message.routing_key,
                message.properties,
                message.body,
                Box::new(acker),
            )
            .redelivered(message.redelivered),
        )
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.consumer_gone(&self.queue, &self.rx);
        }
    }
}

struct InMemoryAcker {
    message: Mutex<Option<Message>>,
    requeue: mpsc::WeakUnboundedSender<Message>,
    depth: Arc<AtomicUsize>,
    shared: Weak<Shared>,
    _permit: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        if self.message.lock().take().is_none() {
            return Err(BusError::Broker("delivery already settled".into()));
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.acked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        let Some(mut message) = self.message.lock().take() else {
            return Err(BusError::Broker("delivery already settled".into()));
        };
        if let Some(shared) = self.shared.upgrade() {
            shared.nacked.fetch_add(1, Ordering::SeqCst);
        }
        if requeue {
            if let Some(tx) = self.requeue.upgrade() {
                message.redelivered = true;
                self.depth.fetch_add(1, Ordering::SeqCst);
                if tx.send(message).is_err() {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }
}
