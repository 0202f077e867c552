//! Bounded, self-healing connection pool.
//!
//! The pool hands out live transport connections while bounding the number
//! of connections open at once:
//!
//! - **Checkout** reuses the most recently released idle connection after a
//!   cheap liveness probe, opens a new one while below the size limit, or
//!   waits for a release until the caller's timeout.
//! - **Release** returns a connection to the idle set, or closes it when the
//!   pool is shutting down, the connection is flagged dead, or the idle set is
//!   already full.
//! - A background **reaper** closes idle connections that have not been used
//!   for longer than the idle timeout.
//!
//! # Locking
//!
//! One `tokio::sync::Mutex` guards the idle deque together with the
//! checked-out and in-flight-creation counts. Transport I/O (open, ping,
//! close) never happens while that lock is held.
//!
//! # Example
//!
//! ```rust,ignore
//! use beatpool::config::PoolConfig;
//! use beatpool::pool::ConnectionPool;
//! use beatpool::transport::LoopbackTransport;
//!
//! let pool = ConnectionPool::new(LoopbackTransport::new(), PoolConfig::default());
//! let conn = pool.acquire(Duration::from_secs(1)).await?;
//! // ... use conn.handle_mut() with pool.transport() ...
//! pool.release(conn).await;
//! pool.shutdown().await;
//! ```

mod connection;
mod reaper;
mod stats;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{BeatError, Result};
use crate::transport::Transport;

pub use connection::PooledConnection;
pub use stats::{PoolStatsSnapshot, PoolStatus};

use stats::PoolStats;

/// Attempts made to open a connection before giving up.
pub const CREATE_ATTEMPTS: u32 = 3;

/// Base delay between open attempts; attempt `n` waits `n * CREATE_BACKOFF`.
const CREATE_BACKOFF: Duration = Duration::from_millis(50);

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct PoolState<H> {
    idle: VecDeque<PooledConnection<H>>,
    checked_out: usize,
    creating: usize,
}

impl<H> PoolState<H> {
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out + self.creating
    }
}

pub(crate) struct PoolInner<T: Transport> {
    transport: T,
    config: PoolConfig,
    state: Mutex<PoolState<T::Handle>>,
    /// Signalled whenever a slot or an idle connection may have become available.
    available: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    stats: PoolStats,
    reaper_stop: Arc<Notify>,
    reaper: StdMutex<Option<JoinHandle<()>>>,
}

enum Checkout<H> {
    Idle(PooledConnection<H>),
    Create,
    Wait,
}

enum Probe {
    Alive,
    Dead,
    /// The caller's deadline passed before the probe finished.
    Expired,
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Cheaply cloneable handle to a shared connection pool.
pub struct ConnectionPool<T: Transport> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Transport> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("transport", &self.inner.transport.name())
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T: Transport> ConnectionPool<T> {
    /// Create a pool and start its reaper. Must be called within a Tokio runtime.
    ///
    /// Out-of-range settings are clamped, see [`PoolConfig::sanitized`].
    pub fn new(transport: T, config: PoolConfig) -> Self {
        let config = config.sanitized();
        let reaper_interval = config.reaper_interval();
        let reaper_stop = Arc::new(Notify::new());

        let inner = Arc::new(PoolInner {
            transport,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                checked_out: 0,
                creating: 0,
            }),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            stats: PoolStats::default(),
            reaper_stop: Arc::clone(&reaper_stop),
            reaper: StdMutex::new(None),
        });

        let handle = tokio::spawn(reaper::run(
            Arc::downgrade(&inner),
            reaper_stop,
            reaper_interval,
        ));
        *inner.reaper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!(
            transport = inner.transport.name(),
            max_size = inner.config.max_cached_connections,
            idle_timeout_secs = inner.config.idle_timeout_secs,
            reaper_interval_secs = inner.config.reaper_interval_secs,
            "Connection pool created"
        );

        Self { inner }
    }

    /// The transport connections are opened with.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Effective (clamped) configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Check out a live connection, waiting up to `timeout` for one to free up.
    ///
    /// `timeout` bounds the whole call, including liveness probes and opening
    /// new connections. `Duration::MAX` waits indefinitely.
    ///
    /// # Errors
    ///
    /// - [`BeatError::PoolExhausted`] if no connection could be handed out
    ///   within `timeout`.
    /// - [`BeatError::PoolCreationFailed`] if a new connection was needed and
    ///   every open attempt failed.
    /// - [`BeatError::PoolClosed`] once [`ConnectionPool::shutdown`] has run.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<T::Handle>> {
        let inner = &self.inner;
        let deadline = deadline_after(timeout);
        let mut counted_wait = false;

        loop {
            // Register interest before inspecting state so a release between
            // the check and the wait is not missed.
            let notified = inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if inner.is_closed() {
                return Err(BeatError::PoolClosed);
            }

            let step = {
                let mut state = inner.state.lock().await;
                if let Some(conn) = state.idle.pop_back() {
                    state.checked_out += 1;
                    Checkout::Idle(conn)
                } else if state.total() < inner.config.max_cached_connections {
                    state.creating += 1;
                    Checkout::Create
                } else {
                    Checkout::Wait
                }
            };

            match step {
                Checkout::Idle(mut conn) => {
                    match inner.probe(&mut conn, deadline).await {
                        Probe::Alive => {
                            conn.touch();
                            debug!(connection = conn.id(), "Reusing idle connection");
                            return Ok(conn);
                        }
                        Probe::Expired => {
                            // Not known to be dead; keep it cached.
                            self.release(conn).await;
                            warn!("Acquire timed out after {:?} while probing", timeout);
                            return Err(BeatError::PoolExhausted { waited: timeout });
                        }
                        Probe::Dead => {}
                    }

                    inner.stats.record_probe_failure();
                    warn!(
                        connection = conn.id(),
                        "Idle connection failed liveness probe, replacing"
                    );
                    inner.close_connection(conn).await;
                    {
                        // Hand the dead connection's slot to its replacement.
                        let mut state = inner.state.lock().await;
                        state.checked_out = state.checked_out.saturating_sub(1);
                        state.creating += 1;
                    }
                    return inner.create_connection(deadline, timeout).await;
                }
                Checkout::Create => return inner.create_connection(deadline, timeout).await,
                Checkout::Wait => {
                    if !counted_wait {
                        counted_wait = true;
                        inner.stats.record_exhausted_wait();
                        debug!(
                            max_size = inner.config.max_cached_connections,
                            "Pool exhausted, waiting for a release"
                        );
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!("Pool exhausted, acquire timed out after {:?}", timeout);
                        return Err(BeatError::PoolExhausted { waited: timeout });
                    }
                }
            }
        }
    }

    /// Return a checked-out connection.
    ///
    /// The connection is cached for reuse unless the pool is shut down or the
    /// connection was marked dead, in which case it is closed. Never waits
    /// for capacity.
    pub async fn release(&self, mut conn: PooledConnection<T::Handle>) {
        let inner = &self.inner;
        conn.touch();

        let rejected = {
            let mut state = inner.state.lock().await;
            state.checked_out = state.checked_out.saturating_sub(1);
            if inner.is_closed() {
                Some((conn, "pool shut down"))
            } else if !conn.is_alive() {
                Some((conn, "connection marked dead"))
            } else if state.idle.len() >= inner.config.max_cached_connections {
                // Unreachable for this pool's own connections: idle + checked_out <= max.
                Some((conn, "idle set full"))
            } else {
                state.idle.push_back(conn);
                None
            }
        };
        inner.available.notify_one();

        if let Some((conn, reason)) = rejected {
            debug!(connection = conn.id(), reason, "Closing released connection");
            inner.close_connection(conn).await;
        }
    }

    /// Close a connection the caller knows is broken and free its slot.
    pub async fn discard(&self, mut conn: PooledConnection<T::Handle>) {
        conn.mark_dead();
        self.release(conn).await;
    }

    /// Close every idle connection and stop the reaper. Idempotent.
    ///
    /// Waiting `acquire` calls fail with [`BeatError::PoolClosed`].
    /// Connections still checked out are closed when they are released.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down connection pool");

        inner.reaper_stop.notify_one();
        inner.available.notify_waiters();

        let reaper = inner
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = reaper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pool reaper task ended abnormally");
            }
        }

        let (idle, checked_out) = {
            let mut state = inner.state.lock().await;
            let idle: Vec<_> = state.idle.drain(..).collect();
            (idle, state.checked_out)
        };
        let closed_idle = idle.len();
        for conn in idle {
            inner.close_connection(conn).await;
        }

        info!(
            closed_idle,
            still_checked_out = checked_out,
            "Connection pool shut down"
        );
    }

    /// Current occupancy.
    pub async fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock().await;
        PoolStatus {
            idle: state.idle.len(),
            checked_out: state.checked_out,
            creating: state.creating,
            max_size: self.inner.config.max_cached_connections,
        }
    }

    /// Snapshot of the lifetime counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl<T: Transport> PoolInner<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Probe a connection, bounded by the probe timeout and by `deadline`,
    /// whichever comes first. Never errors.
    async fn probe(&self, conn: &mut PooledConnection<T::Handle>, deadline: Instant) -> Probe {
        if !conn.is_alive() {
            return Probe::Dead;
        }
        let probe_deadline = deadline_after(self.config.probe_timeout()).min(deadline);
        let alive = match tokio::time::timeout_at(
            probe_deadline,
            self.transport.ping(conn.handle_mut()),
        )
        .await
        {
            Ok(alive) => alive,
            Err(_) if probe_deadline == deadline => return Probe::Expired,
            Err(_) => {
                debug!(connection = conn.id(), "Liveness probe timed out");
                false
            }
        };
        conn.set_alive(alive);
        if alive {
            Probe::Alive
        } else {
            Probe::Dead
        }
    }

    /// Fill a slot already reserved in `state.creating`, giving up at `deadline`.
    async fn create_connection(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PooledConnection<T::Handle>> {
        let opened = match tokio::time::timeout_at(deadline, self.open_with_retry()).await {
            Ok(opened) => opened,
            Err(_) => {
                warn!("Acquire timed out after {:?} while opening a connection", timeout);
                Err(BeatError::PoolExhausted { waited: timeout })
            }
        };

        let mut state = self.state.lock().await;
        state.creating = state.creating.saturating_sub(1);
        match opened {
            Ok(handle) => {
                let conn = PooledConnection::new(self.next_id.fetch_add(1, Ordering::Relaxed), handle);
                if self.is_closed() {
                    drop(state);
                    self.close_connection(conn).await;
                    return Err(BeatError::PoolClosed);
                }
                state.checked_out += 1;
                debug!(
                    connection = conn.id(),
                    checked_out = state.checked_out,
                    "Opened new pooled connection"
                );
                Ok(conn)
            }
            Err(e) => {
                drop(state);
                // The reserved slot is free again; let a waiter try.
                self.available.notify_one();
                Err(e)
            }
        }
    }

    async fn open_with_retry(&self) -> Result<T::Handle> {
        let mut last_error = String::new();
        for attempt in 1..=CREATE_ATTEMPTS {
            match self.transport.open().await {
                Ok(handle) => {
                    self.stats.record_created();
                    return Ok(handle);
                }
                Err(e) => {
                    self.stats.record_creation_failure();
                    warn!(
                        attempt,
                        max_attempts = CREATE_ATTEMPTS,
                        error = %e,
                        "Failed to open connection"
                    );
                    last_error = e.to_string();
                    if attempt < CREATE_ATTEMPTS {
                        tokio::time::sleep(CREATE_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(BeatError::PoolCreationFailed {
            attempts: CREATE_ATTEMPTS,
            reason: last_error,
        })
    }

    /// Close a connection through the transport. Close errors are logged only.
    async fn close_connection(&self, conn: PooledConnection<T::Handle>) {
        let id = conn.id();
        self.stats.record_closed();
        if let Err(e) = self.transport.close(conn.into_handle()).await {
            warn!(connection = id, error = %e, "Error closing pooled connection");
        }
    }

    /// Remove idle connections older than the idle timeout or flagged dead.
    ///
    /// Returns the number of connections closed.
    async fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let expired = {
            let mut state = self.state.lock().await;
            let (keep, expired): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|conn| conn.is_alive() && conn.idle_for() <= idle_timeout);
            state.idle = keep.into();
            expired
        };

        if expired.is_empty() {
            return 0;
        }

        let mut evicted = 0u64;
        let count = expired.len();
        for conn in expired {
            if conn.is_alive() {
                evicted += 1;
            }
            debug!(
                connection = conn.id(),
                idle_secs = conn.idle_for().as_secs(),
                alive = conn.is_alive(),
                "Reaper closing idle connection"
            );
            self.close_connection(conn).await;
        }
        self.stats.record_idle_evicted(evicted);
        self.available.notify_one();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::HeartbeatMessage;
    use crate::transport::LoopbackTransport;
    use async_trait::async_trait;
    use std::collections::HashSet;

    fn config(max: usize) -> PoolConfig {
        PoolConfig {
            max_cached_connections: max,
            ..Default::default()
        }
    }

    fn pool(max: usize) -> (ConnectionPool<LoopbackTransport>, LoopbackTransport) {
        let transport = LoopbackTransport::new();
        (ConnectionPool::new(transport.clone(), config(max)), transport)
    }

    #[tokio::test]
    async fn test_new_clamps_config() {
        let transport = LoopbackTransport::new();
        let pool = ConnectionPool::new(
            transport,
            PoolConfig {
                max_cached_connections: 99,
                idle_timeout_secs: 1,
                ..Default::default()
            },
        );
        assert_eq!(pool.config().max_cached_connections, 20);
        assert_eq!(pool.config().idle_timeout_secs, 300);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_creates_then_reuses() {
        let (pool, transport) = pool(2);

        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let first_id = conn.id();
        assert_eq!(pool.status().await.checked_out, 1);
        pool.release(conn).await;

        let status = pool.status().await;
        assert_eq!(status.idle, 1);
        assert_eq!(status.checked_out, 0);

        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.id(), first_id);
        assert_eq!(transport.opened(), 1);
        pool.release(conn).await;
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_then_release_succeeds() {
        let (pool, _transport) = pool(2);

        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let started = Instant::now();
        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, BeatError::PoolExhausted { .. }));
        assert!(elapsed >= Duration::from_millis(100), "returned early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(150), "returned late: {:?}", elapsed);
        assert_eq!(pool.stats().exhausted_waits, 1);

        let released_id = a.id();
        pool.release(a).await;
        let c = pool.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(c.id(), released_id);

        pool.release(b).await;
        pool.release(c).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhaustion_timeout_real_clock() {
        let (pool, _transport) = pool(1);
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let started = std::time::Instant::now();
        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, BeatError::PoolExhausted { .. }));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(600));

        pool.release(held).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiter_woken_by_release() {
        let (pool, _transport) = pool(1);
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held).await;

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.id(), held_id);
        pool.release(conn).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_failure_replaces_connection() {
        let (pool, transport) = pool(2);
        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let old_id = conn.id();
        pool.release(conn).await;

        transport.kill_open_connections();
        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(conn.id(), old_id);
        assert!(conn.is_alive());

        let stats = pool.stats();
        assert_eq!(stats.probe_failures, 1);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.closed, 1);
        assert_eq!(transport.closed(), 1);

        let status = pool.status().await;
        assert_eq!(status.checked_out, 1);
        assert_eq!(status.idle, 0);
        pool.release(conn).await;
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_failure_after_retries() {
        let (pool, transport) = pool(2);
        transport.set_reachable(false);

        let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
        match err {
            BeatError::PoolCreationFailed { attempts, reason } => {
                assert_eq!(attempts, CREATE_ATTEMPTS);
                assert!(reason.contains("unreachable"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pool.stats().creation_failures, CREATE_ATTEMPTS as u64);
        assert_eq!(pool.status().await.total(), 0);

        // Transport recovers: the freed slot is usable.
        transport.set_reachable(true);
        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(conn).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_dead_connection_closes_it() {
        let (pool, transport) = pool(2);
        let mut conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        conn.mark_dead();
        pool.release(conn).await;

        let status = pool.status().await;
        assert_eq!(status.idle, 0);
        assert_eq!(status.checked_out, 0);
        assert_eq!(transport.closed(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let (pool, transport) = pool(1);
        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.discard(conn).await;

        assert_eq!(transport.closed(), 1);
        let conn = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(transport.opened(), 2);
        pool.release(conn).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_releasing_every_connection_fills_idle_without_closing() {
        let (pool, transport) = pool(2);
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();

        pool.release(a).await;
        pool.release(b).await;

        let status = pool.status().await;
        assert_eq!(status.idle, 2);
        assert_eq!(status.checked_out, 0);
        assert_eq!(transport.closed(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_with_max_timeout() {
        let (pool, _transport) = pool(1);
        let conn = pool.acquire(Duration::MAX).await.unwrap();
        pool.release(conn).await;

        // Reuse path as well as the create path.
        let conn = pool.acquire(Duration::MAX).await.unwrap();
        pool.release(conn).await;
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_stale_idle_connections() {
        let (pool, transport) = pool(3);
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let a_id = a.id();
        let b_id = b.id();
        pool.release(a).await;
        pool.release(b).await;

        // Keep `b` warm at t=200s.
        tokio::time::sleep(Duration::from_secs(200)).await;
        let warm = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(warm.id(), b_id);
        pool.release(warm).await;

        // At the t=310s tick `a` has idled 310s (> 300s) and `b` only 110s.
        tokio::time::sleep(Duration::from_secs(115)).await;
        let status = pool.status().await;
        assert_eq!(status.idle, 1);
        assert_eq!(pool.stats().idle_evicted, 1);
        assert_eq!(transport.closed(), 1);

        let survivor = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(survivor.id(), b_id);
        assert_ne!(survivor.id(), a_id);
        pool.release(survivor).await;
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_ignores_checked_out_connections() {
        let (pool, transport) = pool(2);
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1000)).await;
        assert_eq!(pool.stats().idle_evicted, 0);
        assert_eq!(transport.closed(), 0);
        assert_eq!(pool.status().await.checked_out, 1);

        pool.release(held).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_and_late_releases() {
        let (pool, transport) = pool(3);
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(a).await;

        pool.shutdown().await;
        assert!(pool.is_closed());
        assert_eq!(transport.closed(), 1);
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)).await,
            Err(BeatError::PoolClosed)
        ));

        pool.release(b).await;
        assert_eq!(transport.closed(), 2);
        assert_eq!(pool.status().await.total(), 0);

        // Idempotent.
        pool.shutdown().await;
        assert_eq!(transport.closed(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let (pool, _transport) = pool(1);
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake on shutdown")
            .unwrap();
        assert!(matches!(result, Err(BeatError::PoolClosed)));
        pool.release(held).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkouts_stay_bounded_and_exclusive() {
        let (pool, transport) = pool(3);
        let in_use = Arc::new(StdMutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            let transport = transport.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let conn = pool.acquire(Duration::from_secs(5)).await.unwrap();
                    assert!(
                        in_use.lock().unwrap().insert(conn.id()),
                        "connection {} handed out twice",
                        conn.id()
                    );
                    let open = transport.opened() - transport.closed();
                    assert!(open <= 3, "{} connections open", open);

                    tokio::task::yield_now().await;

                    in_use.lock().unwrap().remove(&conn.id());
                    pool.release(conn).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let status = pool.status().await;
        assert!(status.total() <= 3);
        assert_eq!(status.checked_out, 0);
        pool.shutdown().await;
    }

    /// Transport whose probes hang forever and whose close always fails.
    struct StuckTransport {
        inner: LoopbackTransport,
    }

    #[async_trait]
    impl Transport for StuckTransport {
        type Handle = crate::transport::LoopbackHandle;

        fn name(&self) -> &str {
            "stuck"
        }

        async fn open(&self) -> Result<Self::Handle> {
            self.inner.open().await
        }

        async fn ping(&self, _handle: &mut Self::Handle) -> bool {
            std::future::pending::<()>().await;
            true
        }

        async fn send(&self, handle: &mut Self::Handle, message: &HeartbeatMessage) -> Result<()> {
            self.inner.send(handle, message).await
        }

        async fn receive(&self, handle: &mut Self::Handle) -> Result<Option<HeartbeatMessage>> {
            self.inner.receive(handle).await
        }

        async fn close(&self, _handle: Self::Handle) -> Result<()> {
            Err(BeatError::Transport("close failed".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_and_close_errors_stay_inside_pool() {
        let pool = ConnectionPool::new(
            StuckTransport {
                inner: LoopbackTransport::new(),
            },
            PoolConfig {
                max_cached_connections: 1,
                probe_timeout_ms: 100,
                ..Default::default()
            },
        );

        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let first = conn.id();
        pool.release(conn).await;

        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(conn.id(), first);
        assert_eq!(pool.stats().probe_failures, 1);
        assert_eq!(pool.stats().closed, 1);

        pool.release(conn).await;
        pool.shutdown().await;
    }

    /// Transport whose `open` takes far longer than callers are willing to wait.
    struct SlowOpenTransport {
        inner: LoopbackTransport,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowOpenTransport {
        type Handle = crate::transport::LoopbackHandle;

        fn name(&self) -> &str {
            "slow-open"
        }

        async fn open(&self) -> Result<Self::Handle> {
            tokio::time::sleep(self.delay).await;
            self.inner.open().await
        }

        async fn ping(&self, handle: &mut Self::Handle) -> bool {
            self.inner.ping(handle).await
        }

        async fn send(&self, handle: &mut Self::Handle, message: &HeartbeatMessage) -> Result<()> {
            self.inner.send(handle, message).await
        }

        async fn receive(&self, handle: &mut Self::Handle) -> Result<Option<HeartbeatMessage>> {
            self.inner.receive(handle).await
        }

        async fn close(&self, handle: Self::Handle) -> Result<()> {
            self.inner.close(handle).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_open_respects_acquire_timeout() {
        let pool = ConnectionPool::new(
            SlowOpenTransport {
                inner: LoopbackTransport::new(),
                delay: Duration::from_secs(10),
            },
            config(2),
        );

        let started = Instant::now();
        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, BeatError::PoolExhausted { .. }));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1), "returned late: {:?}", elapsed);

        // The reserved slot was handed back.
        let status = pool.status().await;
        assert_eq!(status.total(), 0);
        assert_eq!(pool.stats().created, 0);

        let conn = pool.acquire(Duration::from_secs(20)).await.unwrap();
        pool.release(conn).await;
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_respects_acquire_timeout() {
        let pool = ConnectionPool::new(
            StuckTransport {
                inner: LoopbackTransport::new(),
            },
            PoolConfig {
                max_cached_connections: 1,
                probe_timeout_ms: 2000,
                ..Default::default()
            },
        );
        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let id = conn.id();
        pool.release(conn).await;

        let started = Instant::now();
        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, BeatError::PoolExhausted { .. }));
        assert!(elapsed < Duration::from_millis(500), "returned late: {:?}", elapsed);

        // The unprobed connection went back to the idle set, not to the closer.
        let status = pool.status().await;
        assert_eq!(status.idle, 1);
        assert_eq!(status.checked_out, 0);
        assert_eq!(pool.stats().probe_failures, 0);
        assert_eq!(pool.stats().closed, 0);

        // A caller with more patience sees the regular probe timeout and a replacement.
        let conn = pool.acquire(Duration::from_secs(5)).await.unwrap();
        assert_ne!(conn.id(), id);
        pool.release(conn).await;
        pool.shutdown().await;
    }
}
