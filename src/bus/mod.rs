//! Broker abstraction.
//!
//! The bus layers only need a handful of broker primitives, expressed as
//! traits so the same listener and publisher run against any broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │         Listener / Publisher / ReplyRouter                   │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Connector ─► Connection ─► Channel ─► Consumer ─► Delivery  │
//! │  declare_exchange / declare_queue / bind_queue / qos         │
//! │  publish(exchange, key, properties, body) / ack / nack       │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                  │
//!          ▼                                  ▼
//! ┌─────────────────┐              ┌─────────────────────┐
//! │ InMemoryBroker  │              │ AMQP adapter        │
//! │   (included)    │              │   (external)        │
//! └─────────────────┘              └─────────────────────┘
//! ```

mod broker;
mod delivery;
mod in_memory;

pub use broker::{Channel, Connection, Connector, Consumer};
pub(crate) use delivery::topic_matches;
pub use delivery::{Acknowledger, Delivery, ExchangeKind, Properties, QueueOptions};
pub use in_memory::InMemoryBroker;
