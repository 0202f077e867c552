//! Dispatcher lifecycle state and counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lifecycle of a single dispatcher instance.
///
/// `Created -> Running -> Stopping -> Stopped`. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatcherState::Created => "created",
            DispatcherState::Running => "running",
            DispatcherState::Stopping => "stopping",
            DispatcherState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Operating mode chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherMode {
    Publisher,
    Consumer,
}

impl fmt::Display for DispatcherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatcherMode::Publisher => f.write_str("publisher"),
            DispatcherMode::Consumer => f.write_str("consumer"),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
}

impl DispatchStats {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a dispatcher's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    /// Messages sent successfully.
    pub published: u64,
    /// Publish attempts that failed to acquire a connection or to send.
    pub publish_failures: u64,
    /// Messages taken off the transport, including ones later dropped.
    pub received: u64,
    /// Messages a handler processed without error.
    pub dispatched: u64,
    /// Messages with no registered handler, or frames that failed to decode.
    pub dropped: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_errors: u64,
}
