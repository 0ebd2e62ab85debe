//! Cancellable one-shot timer.
//!
//! A `Deadline` either fires or is cancelled, never both. Both sides race on
//! one state word with compare-and-swap:
//!
//! ```text
//!            cancel() ──► Cancelled   (cancel returns true, callback never runs)
//!   Armed ──┤
//!            timer    ──► Fired       (callback runs, cancel returns false)
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

const ARMED: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// A timer that runs a callback once after a delay unless cancelled first.
///
/// Must be created inside a tokio runtime.
pub struct Deadline {
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

impl Deadline {
    /// Arm a deadline that calls `on_fire` after `after`.
    pub fn start<F>(after: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(ARMED));
        let timer_state = Arc::clone(&state);

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if timer_state
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                on_fire();
            }
        });

        Self { state, task }
    }

    /// Cancel the deadline.
    ///
    /// Returns `true` if this call won the race and the callback will never
    /// run; `false` if the deadline already fired or was already cancelled.
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.task.abort();
        }
        won
    }

    /// Whether the timer has fired.
    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    /// Whether the deadline was cancelled before firing.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel();
    }
}
