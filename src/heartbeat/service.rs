//! Heartbeat dispatcher implementation.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bus::HeartbeatMessage;
use crate::config::HeartbeatConfig;
use crate::error::{BeatError, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::transport::Transport;

use super::handler::{HandlerRegistry, MessageHandler};
use super::state::{DispatchStats, DispatchStatsSnapshot, DispatcherMode, DispatcherState};

/// Consecutive reconnects allowed while no frame arrives before `listen` gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Base delay before a reconnect; reconnect `n` waits `n * RECONNECT_BACKOFF`.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared between the dispatcher handle and its background loop.
struct Shared<T: Transport> {
    pool: ConnectionPool<T>,
    config: HeartbeatConfig,
    state: watch::Sender<DispatcherState>,
    stop: Notify,
    handlers: StdRwLock<HandlerRegistry>,
    stats: DispatchStats,
    sequence: AtomicU64,
}

impl<T: Transport> Shared<T> {
    fn current_state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Leave `Running` after the loop ended: a pending stop wins, otherwise
    /// the instance goes back to `Created` so the caller can retry.
    fn settle_after_failure(&self) {
        self.state.send_modify(|state| {
            *state = if *state == DispatcherState::Stopping {
                DispatcherState::Stopped
            } else {
                DispatcherState::Created
            };
        });
    }

    /// Acquire, send, release. The connection goes back to the pool even if
    /// the send fails.
    async fn publish(&self, message: &HeartbeatMessage) -> Result<()> {
        let mut conn = match self.pool.acquire(self.config.acquire_timeout()).await {
            Ok(conn) => conn,
            Err(e) => {
                self.stats.record_publish_failure();
                return Err(BeatError::ConnectionUnavailable(e.to_string()));
            }
        };

        let sent = self
            .pool
            .transport()
            .send(conn.handle_mut(), message)
            .await;
        let connection = conn.id();
        self.pool.release(conn).await;

        match sent {
            Ok(()) => {
                self.stats.record_published();
                debug!(
                    id = message.id(),
                    kind = message.kind(),
                    connection,
                    "Published message"
                );
                Ok(())
            }
            Err(e) => {
                self.stats.record_publish_failure();
                Err(e)
            }
        }
    }

    async fn dispatch(&self, handlers: &HandlerRegistry, message: HeartbeatMessage) {
        self.stats.record_received();

        let Some(handler) = handlers.get(message.kind()) else {
            self.stats.record_dropped();
            debug!(
                id = message.id(),
                kind = message.kind(),
                "No handler registered, dropping message"
            );
            return;
        };

        match AssertUnwindSafe(handler.handle(&message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {
                self.stats.record_dispatched();
                debug!(id = message.id(), kind = message.kind(), "Dispatched message");
            }
            Ok(Err(e)) => {
                self.stats.record_handler_error();
                let err = BeatError::Handler {
                    kind: message.kind().to_string(),
                    message: e.to_string(),
                };
                error!(id = message.id(), error = %err, "Handler failed");
            }
            Err(panic) => {
                self.stats.record_handler_error();
                let err = BeatError::Handler {
                    kind: message.kind().to_string(),
                    message: format!("panicked: {}", panic_message(panic.as_ref())),
                };
                error!(id = message.id(), error = %err, "Handler failed");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Periodic heartbeat publisher or message consumer on top of a [`ConnectionPool`].
///
/// The mode is fixed at construction:
///
/// - [`HeartbeatDispatcher::publisher`]: [`start`](Self::start) spawns a loop
///   that sends a `"heartbeat"` message every interval.
/// - [`HeartbeatDispatcher::consumer`]: [`listen`](Self::listen) holds one
///   pooled connection and routes each inbound message to the handler
///   registered for its kind.
///
/// Each instance runs once: `Created -> Running -> Stopping -> Stopped`.
///
/// # Example
///
/// ```rust,ignore
/// let pool = ConnectionPool::new(LoopbackTransport::new(), PoolConfig::default());
///
/// let consumer = Arc::new(HeartbeatDispatcher::consumer(pool.clone(), HeartbeatConfig::default()));
/// consumer.register_handler("heartbeat", |msg: &HeartbeatMessage| -> Result<()> {
///     println!("beat {}", msg.id());
///     Ok(())
/// })?;
/// let listener = tokio::spawn({
///     let consumer = Arc::clone(&consumer);
///     async move { consumer.listen().await }
/// });
///
/// let publisher = HeartbeatDispatcher::publisher(pool.clone(), HeartbeatConfig::default());
/// publisher.start(Duration::from_secs(30)).await?;
/// ```
pub struct HeartbeatDispatcher<T: Transport> {
    shared: Arc<Shared<T>>,
    mode: DispatcherMode,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> std::fmt::Debug for HeartbeatDispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatDispatcher")
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl<T: Transport> HeartbeatDispatcher<T> {
    fn new(pool: ConnectionPool<T>, config: HeartbeatConfig, mode: DispatcherMode) -> Self {
        let (state, _) = watch::channel(DispatcherState::Created);
        Self {
            shared: Arc::new(Shared {
                pool,
                config,
                state,
                stop: Notify::new(),
                handlers: StdRwLock::new(HandlerRegistry::new()),
                stats: DispatchStats::default(),
                sequence: AtomicU64::new(0),
            }),
            mode,
            task: StdMutex::new(None),
        }
    }

    /// Create a dispatcher that publishes heartbeats.
    pub fn publisher(pool: ConnectionPool<T>, config: HeartbeatConfig) -> Self {
        Self::new(pool, config, DispatcherMode::Publisher)
    }

    /// Create a dispatcher that consumes and dispatches messages.
    pub fn consumer(pool: ConnectionPool<T>, config: HeartbeatConfig) -> Self {
        Self::new(pool, config, DispatcherMode::Consumer)
    }

    pub fn mode(&self) -> DispatcherMode {
        self.mode
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.current_state()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Kinds with a registered handler.
    pub fn handler_kinds(&self) -> Vec<String> {
        self.shared
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .kinds()
    }

    /// Move `Created -> Running` for the given entry point.
    fn begin(&self, operation: &'static str, required: DispatcherMode) -> Result<()> {
        if self.mode != required {
            return Err(BeatError::InvalidState {
                operation,
                state: format!("in {} mode", self.mode),
            });
        }

        let mut observed = DispatcherState::Created;
        let started = self.shared.state.send_if_modified(|state| {
            observed = *state;
            if *state == DispatcherState::Created {
                *state = DispatcherState::Running;
                true
            } else {
                false
            }
        });

        if started {
            Ok(())
        } else {
            Err(BeatError::InvalidState {
                operation,
                state: observed.to_string(),
            })
        }
    }

    /// Start publishing a heartbeat every `interval`.
    ///
    /// Returns once the loop is running. The first heartbeat goes out one
    /// interval after this call.
    ///
    /// # Errors
    ///
    /// - [`BeatError::InvalidState`] if this is not a publisher in `Created`.
    /// - [`BeatError::ConnectionUnavailable`] if the pool cannot provide a
    ///   connection; the dispatcher returns to `Created`.
    pub async fn start(&self, interval: Duration) -> Result<()> {
        self.begin("start", DispatcherMode::Publisher)?;

        match self
            .shared
            .pool
            .acquire(self.shared.config.acquire_timeout())
            .await
        {
            Ok(conn) => self.shared.pool.release(conn).await,
            Err(e) => {
                self.shared.settle_after_failure();
                error!(error = %e, "Heartbeat publisher could not obtain a connection");
                return Err(BeatError::ConnectionUnavailable(e.to_string()));
            }
        }

        let interval = interval.max(Duration::from_millis(1));
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run_publisher(shared, interval));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!(
            "Heartbeat publisher started (interval={:?}, source={})",
            interval, self.shared.config.source
        );
        Ok(())
    }

    /// Send a single message through the pool right away.
    ///
    /// # Errors
    ///
    /// [`BeatError::ConnectionUnavailable`] if no connection could be
    /// acquired, or the transport's error if the send failed.
    pub async fn publish(&self, message: &HeartbeatMessage) -> Result<()> {
        if self.mode != DispatcherMode::Publisher {
            return Err(BeatError::InvalidState {
                operation: "publish",
                state: format!("in {} mode", self.mode),
            });
        }
        self.shared.publish(message).await
    }

    /// Register the handler for `kind`. Only allowed before [`listen`](Self::listen).
    ///
    /// Registering a kind twice replaces the earlier handler and returns
    /// [`BeatError::DuplicateHandler`] as a warning; the new handler is in
    /// effect either way.
    pub fn register_handler<H>(&self, kind: &str, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        if self.mode != DispatcherMode::Consumer {
            return Err(BeatError::InvalidState {
                operation: "register handler",
                state: format!("in {} mode", self.mode),
            });
        }
        // `listen` leaves `Created` under this same lock.
        let mut handlers = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let state = self.state();
        if state != DispatcherState::Created {
            return Err(BeatError::InvalidState {
                operation: "register handler",
                state: state.to_string(),
            });
        }
        let previous = handlers.insert(kind, Arc::new(handler));
        drop(handlers);

        if previous.is_some() {
            warn!(kind, "Replacing existing handler");
            return Err(BeatError::DuplicateHandler {
                kind: kind.to_string(),
            });
        }
        debug!(kind, "Registered handler");
        Ok(())
    }

    /// Receive and dispatch messages until [`stop`](Self::stop) is called.
    ///
    /// Holds one pooled connection for the whole session. If that connection
    /// breaks, it is discarded and a replacement is acquired after a short
    /// backoff. After [`MAX_RECONNECT_ATTEMPTS`] reconnects in a row without
    /// a single frame arriving, the peer is treated as unusable.
    ///
    /// # Errors
    ///
    /// - [`BeatError::InvalidState`] if this is not a consumer in `Created`.
    /// - [`BeatError::ConnectionUnavailable`] if no connection could be
    ///   obtained, or the reconnect limit was hit; the dispatcher returns to
    ///   `Created` unless a stop was requested meanwhile.
    pub async fn listen(&self) -> Result<()> {
        let shared = &self.shared;
        let handlers = {
            let registry = shared.handlers.write().unwrap_or_else(|e| e.into_inner());
            self.begin("listen", DispatcherMode::Consumer)?;
            registry.clone()
        };
        let acquire_timeout = shared.config.acquire_timeout();

        let mut conn: PooledConnection<T::Handle> = match shared.pool.acquire(acquire_timeout).await
        {
            Ok(conn) => conn,
            Err(e) => {
                shared.settle_after_failure();
                error!(error = %e, "Heartbeat consumer could not obtain a connection");
                return Err(BeatError::ConnectionUnavailable(e.to_string()));
            }
        };

        info!(
            connection = conn.id(),
            handlers = ?handlers.kinds(),
            "Heartbeat consumer listening"
        );

        let transport = shared.pool.transport();
        let mut losses: u32 = 0;
        let (outcome, held) = loop {
            let event = tokio::select! {
                biased;
                _ = shared.stop.notified() => None,
                received = transport.receive(conn.handle_mut()) => Some(received),
            };
            let Some(received) = event else {
                break (Ok(()), Some(conn));
            };

            match received {
                Ok(Some(message)) => {
                    losses = 0;
                    shared.dispatch(&handlers, message).await;
                }
                Err(BeatError::Json(e)) => {
                    losses = 0;
                    shared.stats.record_received();
                    shared.stats.record_dropped();
                    warn!(error = %e, "Dropping undecodable frame");
                }
                lost => {
                    match lost {
                        Ok(_) => warn!(connection = conn.id(), "Consumer connection closed by peer"),
                        Err(e) => warn!(connection = conn.id(), error = %e, "Consumer connection failed"),
                    }
                    shared.pool.discard(conn).await;

                    losses += 1;
                    if losses > MAX_RECONNECT_ATTEMPTS {
                        break (
                            Err(BeatError::ConnectionUnavailable(format!(
                                "connection lost {} times in a row without receiving a message",
                                losses
                            ))),
                            None,
                        );
                    }
                    let backoff = RECONNECT_BACKOFF * losses;
                    debug!(
                        "Reconnecting in {:?} (attempt {}/{})",
                        backoff, losses, MAX_RECONNECT_ATTEMPTS
                    );
                    let stopped = tokio::select! {
                        biased;
                        _ = shared.stop.notified() => true,
                        _ = tokio::time::sleep(backoff) => false,
                    };
                    if stopped {
                        break (Ok(()), None);
                    }

                    match shared.pool.acquire(acquire_timeout).await {
                        Ok(fresh) => {
                            info!("Consumer reconnected on connection {}", fresh.id());
                            conn = fresh;
                        }
                        Err(e) => {
                            break (Err(BeatError::ConnectionUnavailable(e.to_string())), None);
                        }
                    }
                }
            }
        };

        if let Some(conn) = held {
            shared.pool.release(conn).await;
        }

        match &outcome {
            Ok(()) => {
                shared.state.send_replace(DispatcherState::Stopped);
                info!("Heartbeat consumer stopped");
            }
            Err(e) => {
                shared.settle_after_failure();
                error!(error = %e, "Heartbeat consumer lost its connection");
            }
        }
        outcome
    }

    /// Ask the running loop to exit. Does not wait; see [`wait_stopped`](Self::wait_stopped).
    ///
    /// An in-flight send or handler call finishes first.
    pub fn stop(&self) {
        let signalled = self.shared.state.send_if_modified(|state| {
            if *state == DispatcherState::Running {
                *state = DispatcherState::Stopping;
                true
            } else {
                false
            }
        });
        if signalled {
            info!(mode = %self.mode, "Stopping heartbeat dispatcher");
            self.shared.stop.notify_one();
        } else {
            debug!(mode = %self.mode, state = %self.state(), "Stop ignored");
        }
    }

    /// Wait until the dispatcher reaches `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == DispatcherState::Stopped).await;
    }
}

impl<T: Transport> Drop for HeartbeatDispatcher<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_publisher<T: Transport>(shared: Arc<Shared<T>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shared.stop.notified() => break,
            _ = ticker.tick() => {}
        }
        if shared.current_state() != DispatcherState::Running {
            break;
        }

        let sequence = shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let message = HeartbeatMessage::heartbeat()
            .with_payload("source", shared.config.source.as_str())
            .with_payload("sequence", sequence);

        if let Err(e) = shared.publish(&message).await {
            error!(sequence, error = %e, "Heartbeat publish failed");
        }
    }

    shared.state.send_replace(DispatcherState::Stopped);
    info!("Heartbeat publisher stopped");
}
