//! Listener and publisher configuration.
//!
//! Both sides carry a [`Topology`] so that exchange names and metadata
//! header names are explicit values rather than process-wide constants.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::Topology;

/// Default prefetch for listener and reply consumers.
pub const DEFAULT_PREFETCH: u16 = 15;

/// Default time a query caller waits for a reply.
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 10_000;

/// Log verbosity applied through [`crate::telemetry::init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Install no subscriber at all.
    Disabled,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level, `None` when disabled.
    pub fn directive(&self) -> Option<&'static str> {
        match self {
            LogLevel::Disabled => None,
            LogLevel::Error => Some("error"),
            LogLevel::Warn => Some("warn"),
            LogLevel::Info => Some("info"),
            LogLevel::Debug => Some("debug"),
            LogLevel::Trace => Some("trace"),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive().unwrap_or("disabled"))
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(LogLevel::Disabled),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Broker URL
    pub url: String,

    /// Maximum unacknowledged deliveries per consumer
    pub prefetch: u16,

    /// Log verbosity
    pub log_level: LogLevel,

    /// Exchange and header naming
    pub topology: Topology,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new("memory://localhost")
    }
}

impl ListenerConfig {
    /// Default listener configuration for the given broker URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefetch: DEFAULT_PREFETCH,
            log_level: LogLevel::default(),
            topology: Topology::default(),
        }
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }
}

/// Publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Broker URL
    pub url: String,

    /// Time a query caller waits for a reply, in milliseconds
    pub reply_timeout_ms: u64,

    /// Maximum unacknowledged replies held by the reply consumer
    pub prefetch: u16,

    /// Log verbosity
    pub log_level: LogLevel,

    /// Exchange and header naming
    pub topology: Topology,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::new("memory://localhost")
    }
}

impl PublisherConfig {
    /// Default publisher configuration for the given broker URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            prefetch: DEFAULT_PREFETCH,
            log_level: LogLevel::default(),
            topology: Topology::default(),
        }
    }

    /// Reply timeout as a `Duration`.
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }
}
