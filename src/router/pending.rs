//! Pending-reply table.
//!
//! Every entry is removed exactly once, by whichever of these gets there
//! first under the table lock:
//! - a matching reply that also wins the deadline cancel ([`PendingTable::resolve`])
//! - the fired deadline ([`PendingTable::expire`])
//! - the caller giving up, if it also wins the deadline cancel ([`PendingTable::forget`])
//!
//! A reply that loses the cancel race is dropped without touching the
//! one-shot; the fired deadline owns the entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::deadline::Deadline;
use super::RouterStats;
use crate::error::{BusError, BusResult};

/// Reply body, or the remote handler's error text.
pub(crate) type ReplyBody = Result<Vec<u8>, String>;

type ReplyOutcome = BusResult<Vec<u8>>;

/// The caller's side of a pending query.
pub struct ReplyWaiter {
    correlation_id: String,
    query: String,
    rx: oneshot::Receiver<ReplyOutcome>,
}

impl ReplyWaiter {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Wait for the reply or the deadline.
    pub async fn recv(self) -> BusResult<Vec<u8>> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // The entry was dropped without an outcome: forgotten or torn down.
            Err(_) => Err(BusError::Cancelled { query: self.query }),
        }
    }
}

struct PendingReply {
    query: String,
    tx: oneshot::Sender<ReplyOutcome>,
    deadline: Deadline,
}

/// What happened to an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Handed to the waiting caller.
    Delivered,
    /// The deadline fired first; reply dropped.
    Late,
    /// No pending entry under that correlation id.
    Unmatched,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicUsize,
    expired: AtomicUsize,
    late: AtomicUsize,
    unmatched: AtomicUsize,
    malformed: AtomicUsize,
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<String, PendingReply>>,
    counters: Counters,
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert an entry and arm its deadline.
    pub fn register(
        self: &Arc<Self>,
        query: &str,
        correlation_id: &str,
        timeout: Duration,
    ) -> BusResult<ReplyWaiter> {
        let mut entries = self.entries.lock();
        if entries.contains_key(correlation_id) {
            return Err(BusError::DuplicateCorrelation(correlation_id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let table = Arc::downgrade(self);
        let expiring = correlation_id.to_string();
        let deadline = Deadline::start(timeout, move || {
            if let Some(table) = table.upgrade() {
                table.expire(&expiring);
            }
        });

        entries.insert(
            correlation_id.to_string(),
            PendingReply {
                query: query.to_string(),
                tx,
                deadline,
            },
        );

        Ok(ReplyWaiter {
            correlation_id: correlation_id.to_string(),
            query: query.to_string(),
            rx,
        })
    }

    /// Hand a reply to its waiting caller.
    pub fn resolve(&self, correlation_id: &str, body: ReplyBody) -> Resolution {
        let entry = {
            let mut entries = self.entries.lock();
            let cancelled = entries
                .get(correlation_id)
                .map(|entry| entry.deadline.cancel());
            match cancelled {
                None => {
                    self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                    return Resolution::Unmatched;
                }
                Some(false) => {
                    self.counters.late.fetch_add(1, Ordering::Relaxed);
                    return Resolution::Late;
                }
                Some(true) => entries.remove(correlation_id),
            }
        };

        if let Some(entry) = entry {
            let outcome = body.map_err(|message| BusError::Remote {
                query: entry.query.clone(),
                message,
            });
            // The caller may have stopped waiting; nothing else to do then.
            let _ = entry.tx.send(outcome);
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Resolution::Delivered
    }

    /// Fail a pending entry with a timeout. No-op if it is already gone.
    pub fn expire(&self, correlation_id: &str) -> bool {
        let Some(entry) = self.entries.lock().remove(correlation_id) else {
            return false;
        };

        debug!(correlation_id, query = %entry.query, "reply deadline expired");
        let _ = entry.tx.send(Err(BusError::ReplyTimeout {
            query: entry.query.clone(),
        }));
        self.counters.expired.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove an entry whose caller stopped waiting.
    ///
    /// Returns `false` when the entry is gone or its deadline already fired,
    /// in which case the deadline removes it.
    pub fn forget(&self, correlation_id: &str) -> bool {
        let mut entries = self.entries.lock();
        let cancelled = entries
            .get(correlation_id)
            .is_some_and(|entry| entry.deadline.cancel());
        if cancelled {
            entries.remove(correlation_id);
        }
        cancelled
    }

    pub fn note_malformed(&self) {
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            late: self.counters.late.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }
}
