//! Pool counters.
//!
//! All counters are `AtomicU64` with `Relaxed` ordering: they are
//! observability data, not synchronization. Occupancy (idle / checked out)
//! lives under the pool lock instead, see [`PoolStatus`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters maintained by the pool.
#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    created: AtomicU64,
    closed: AtomicU64,
    idle_evicted: AtomicU64,
    exhausted_waits: AtomicU64,
    probe_failures: AtomicU64,
    creation_failures: AtomicU64,
}

impl PoolStats {
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_evicted(&self, count: u64) {
        self.idle_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_exhausted_wait(&self) {
        self.exhausted_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_failure(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_failure(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            idle_evicted: self.idle_evicted.load(Ordering::Relaxed),
            exhausted_waits: self.exhausted_waits.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    /// Connections successfully opened.
    pub created: u64,
    /// Connections closed for any reason.
    pub closed: u64,
    /// Connections closed by the reaper for exceeding the idle timeout.
    pub idle_evicted: u64,
    /// `acquire` calls that had to wait for a release.
    pub exhausted_waits: u64,
    /// Idle connections that failed their liveness probe on checkout.
    pub probe_failures: u64,
    /// Individual `open` attempts that failed.
    pub creation_failures: u64,
}

/// Current pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub checked_out: usize,
    /// Connections being opened right now.
    pub creating: usize,
    pub max_size: usize,
}

impl PoolStatus {
    /// Idle plus checked-out plus in-flight creations.
    pub fn total(&self) -> usize {
        self.idle + self.checked_out + self.creating
    }
}
