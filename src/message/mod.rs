//! Message envelopes and addressing.
//!
//! Three message patterns travel over the broker:
//!
//! ```text
//!   Cmd    ──► direct exchange  ── key: <target app> ──► <app>.requests        (one consumer app)
//!   Query  ──► direct exchange  ── key: <target app> ──► <app>.requests
//!   Event  ──► events exchange  ── key: <event type> ──► <app>.events.<uuid>  (every listener)
//!                                                           │
//!   reply  ◄── replies exchange ◄─ key: <router id>  ◄──────┘
//! ```
//!
//! Commands and events are both fire-and-forget; the distinction is in the
//! routing. Queries carry a correlation id and the address of the requester's
//! private reply queue. A kind header separates commands from queries on the
//! shared request queue.

mod envelope;
mod topology;

pub use envelope::{Cmd, Event, Query};
pub use topology::{RequestKind, Route, Topology};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BusResult;

/// Encode an envelope as a JSON body.
pub(crate) fn encode<T: Serialize>(message: &T) -> BusResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a JSON body into an envelope.
pub(crate) fn decode<T: DeserializeOwned>(body: &[u8]) -> BusResult<T> {
    Ok(serde_json::from_slice(body)?)
}
