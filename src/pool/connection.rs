//! A transport handle plus the bookkeeping the pool needs to manage it.

use std::fmt;

use tokio::time::{Duration, Instant};

/// A connection owned either by the pool's idle set or by exactly one caller.
///
/// Moving the value out of the pool on `acquire` and back on `release` is
/// what keeps a connection from being handed to two callers at once.
pub struct PooledConnection<H> {
    id: u64,
    handle: H,
    created_at: Instant,
    last_used_at: Instant,
    is_alive: bool,
}

impl<H> PooledConnection<H> {
    pub(crate) fn new(id: u64, handle: H) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            created_at: now,
            last_used_at: now,
            is_alive: true,
        }
    }

    /// Pool-assigned identifier, stable for the connection's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Result of the most recent liveness probe.
    pub fn is_alive(&self) -> bool {
        self.is_alive
    }

    /// Flag the connection as broken so `release` closes it instead of caching it.
    pub fn mark_dead(&mut self) {
        self.is_alive = false;
    }

    pub(crate) fn set_alive(&mut self, alive: bool) {
        self.is_alive = alive;
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Time since the connection was last checked out or returned.
    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(crate) fn into_handle(self) -> H {
        self.handle
    }
}

impl<H> fmt::Debug for PooledConnection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("age", &self.created_at.elapsed())
            .field("idle_for", &self.idle_for())
            .field("is_alive", &self.is_alive)
            .finish_non_exhaustive()
    }
}
