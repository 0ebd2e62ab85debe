//! Commands, events and request/reply queries over a publish/subscribe broker.
//!
//! An application registers handlers on a [`Listener`] and sends messages
//! through a [`Publisher`]. Queries are correlated with their replies by the
//! publisher's [`ReplyRouter`], which bounds every wait with a timeout.
//!
//! The broker sits behind the traits in [`bus`]; [`InMemoryBroker`] runs the
//! whole stack in-process.

pub mod bus;
pub mod config;
mod error;
pub mod listener;
pub mod message;
mod publisher;
pub mod router;
pub mod telemetry;

pub use bus::{Connector, InMemoryBroker};
pub use config::{ListenerConfig, LogLevel, PublisherConfig};
pub use error::{BusError, BusResult, HandlerError};
pub use listener::{Listener, ListenerStats};
pub use message::{Cmd, Event, Query, RequestKind, Topology};
pub use publisher::Publisher;
pub use router::{ReplyRouter, ReplyWaiter, RouterStats};
