//! In-process loopback transport.
//!
//! Every handle opened from the same [`LoopbackTransport`] shares one queue:
//! whatever is sent through any handle is received by exactly one receiving
//! handle, the way competing consumers share a broker queue. Messages travel
//! as JSON frames so the wire encoding is exercised end to end.
//!
//! The transport also exposes fault controls so pool and dispatcher
//! behaviour can be driven deterministically in tests.
//!
//! ```
//! use beatpool::transport::{LoopbackTransport, Transport};
//! use beatpool::HeartbeatMessage;
//!
//! # tokio_test::block_on(async {
//! let transport = LoopbackTransport::new();
//! let mut tx = transport.open().await.unwrap();
//! let mut rx = transport.open().await.unwrap();
//!
//! transport.send(&mut tx, &HeartbeatMessage::heartbeat()).await.unwrap();
//! let received = transport.receive(&mut rx).await.unwrap().unwrap();
//! assert_eq!(received.kind(), "heartbeat");
//! # });
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::bus::HeartbeatMessage;
use crate::error::{BeatError, Result};

use super::Transport;

/// Connection handle issued by [`LoopbackTransport`].
#[derive(Debug)]
pub struct LoopbackHandle {
    id: u64,
    generation: u64,
}

impl LoopbackHandle {
    /// Transport-assigned connection number.
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct LoopbackInner {
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    reachable: AtomicBool,
    generation: AtomicU64,
    next_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    failing_sends: AtomicU32,
}

/// In-memory transport backed by a shared unbounded queue.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("reachable", &self.inner.reachable.load(Ordering::SeqCst))
            .field("opened", &self.opened())
            .field("closed", &self.closed())
            .finish()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(LoopbackInner {
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                reachable: AtomicBool::new(true),
                generation: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                failing_sends: AtomicU32::new(0),
            }),
        }
    }

    /// When unreachable, `open` and `send` fail and every probe reports dead.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Invalidate every handle opened so far. Their probes fail from now on;
    /// handles opened afterwards are unaffected.
    pub fn kill_open_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Make the next `count` sends fail regardless of handle health.
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Push a raw frame onto the queue, bypassing encoding.
    pub fn inject_frame(&self, frame: &str) {
        let _ = self.inner.queue_tx.send(frame.to_string());
    }

    /// Number of successful `open` calls.
    pub fn opened(&self) -> u64 {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn closed(&self) -> u64 {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn is_current(&self, handle: &LoopbackHandle) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
            && handle.generation == self.inner.generation.load(Ordering::SeqCst)
    }

    fn take_send_failure(&self) -> bool {
        self.inner
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    type Handle = LoopbackHandle;

    fn name(&self) -> &str {
        "loopback"
    }

    async fn open(&self) -> Result<LoopbackHandle> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(BeatError::Transport("loopback unreachable".into()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        trace!(connection = id, "Loopback connection opened");
        Ok(LoopbackHandle {
            id,
            generation: self.inner.generation.load(Ordering::SeqCst),
        })
    }

    async fn ping(&self, handle: &mut LoopbackHandle) -> bool {
        self.is_current(handle)
    }

    async fn send(&self, handle: &mut LoopbackHandle, message: &HeartbeatMessage) -> Result<()> {
        if !self.is_current(handle) {
            return Err(BeatError::Transport(format!(
                "loopback connection {} is broken",
                handle.id
            )));
        }
        if self.take_send_failure() {
            return Err(BeatError::Transport("injected send failure".into()));
        }
        let frame = message.to_frame()?;
        self.inner
            .queue_tx
            .send(frame)
            .map_err(|_| BeatError::Transport("loopback queue closed".into()))
    }

    async fn receive(&self, handle: &mut LoopbackHandle) -> Result<Option<HeartbeatMessage>> {
        if !self.is_current(handle) {
            return Err(BeatError::Transport(format!(
                "loopback connection {} is broken",
                handle.id
            )));
        }
        let mut rx = self.inner.queue_rx.lock().await;
        match rx.recv().await {
            Some(frame) => HeartbeatMessage::from_frame(&frame).map(Some),
            None => Ok(None),
        }
    }

    async fn close(&self, handle: LoopbackHandle) -> Result<()> {
        self.inner.closed.fetch_add(1, Ordering::SeqCst);
        trace!(connection = handle.id, "Loopback connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive_across_handles() {
        let transport = LoopbackTransport::new();
        let mut tx = transport.open().await.unwrap();
        let mut rx = transport.open().await.unwrap();
        assert_ne!(tx.id(), rx.id());

        let msg = HeartbeatMessage::heartbeat().with_payload("seq", 1);
        transport.send(&mut tx, &msg).await.unwrap();

        let received = transport.receive(&mut rx).await.unwrap().unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_unreachable_fails_open_and_ping() {
        let transport = LoopbackTransport::new();
        let mut handle = transport.open().await.unwrap();

        transport.set_reachable(false);
        assert!(transport.open().await.is_err());
        assert!(!transport.ping(&mut handle).await);

        transport.set_reachable(true);
        assert!(transport.ping(&mut handle).await);
    }

    #[tokio::test]
    async fn test_kill_only_affects_existing_handles() {
        let transport = LoopbackTransport::new();
        let mut old = transport.open().await.unwrap();
        transport.kill_open_connections();
        let mut fresh = transport.open().await.unwrap();

        assert!(!transport.ping(&mut old).await);
        assert!(transport.ping(&mut fresh).await);
        assert!(transport
            .send(&mut old, &HeartbeatMessage::heartbeat())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fail_next_sends() {
        let transport = LoopbackTransport::new();
        let mut handle = transport.open().await.unwrap();
        transport.fail_next_sends(2);

        let msg = HeartbeatMessage::heartbeat();
        assert!(transport.send(&mut handle, &msg).await.is_err());
        assert!(transport.send(&mut handle, &msg).await.is_err());
        assert!(transport.send(&mut handle, &msg).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_garbage_is_json_error() {
        let transport = LoopbackTransport::new();
        let mut handle = transport.open().await.unwrap();
        transport.inject_frame("{broken");

        let err = transport.receive(&mut handle).await.unwrap_err();
        assert!(matches!(err, BeatError::Json(_)));
    }

    #[tokio::test]
    async fn test_open_close_counters() {
        let transport = LoopbackTransport::new();
        let a = transport.open().await.unwrap();
        let b = transport.open().await.unwrap();
        transport.close(a).await.unwrap();

        assert_eq!(transport.opened(), 2);
        assert_eq!(transport.closed(), 1);
        drop(b);
    }
}
