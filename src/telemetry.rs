//! Logging setup.
//!
//! The crate logs through `tracing`. Listener and publisher constructors call
//! [`init`] with their configured level; the first call that installs a
//! subscriber wins and every later call is a no-op. `RUST_LOG` takes
//! precedence over the configured level.

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Install a formatting subscriber for the given level.
///
/// Returns `true` if this call installed the global subscriber.
pub fn init(level: LogLevel) -> bool {
    let Some(directive) = level.directive() else {
        return false;
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
