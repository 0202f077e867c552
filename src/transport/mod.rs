//! Transport abstraction used by the connection pool and the dispatcher.
//!
//! A transport knows how to open a connection handle, probe it, push a
//! [`HeartbeatMessage`] through it, pull the next one out of it, and close it.
//! The pool and dispatcher depend only on this capability set, never on a
//! concrete broker or protocol.
//!
//! # Implementations
//!
//! - [`LoopbackTransport`]: in-process queue, used by tests and the demo.
//! - [`TcpTransport`]: newline-delimited JSON frames over TCP.

mod loopback;
mod tcp;

use async_trait::async_trait;

use crate::bus::HeartbeatMessage;
use crate::error::Result;

pub use loopback::{LoopbackHandle, LoopbackTransport};
pub use tcp::{TcpHandle, TcpTransport};

/// Capability set a message transport must provide.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Per-connection state owned by whoever holds the connection.
    type Handle: Send + 'static;

    /// Short name used in log events.
    fn name(&self) -> &str;

    /// Open a new connection.
    async fn open(&self) -> Result<Self::Handle>;

    /// Cheap liveness probe. Must not fail; a broken handle reports `false`.
    async fn ping(&self, handle: &mut Self::Handle) -> bool;

    /// Send one message.
    async fn send(&self, handle: &mut Self::Handle, message: &HeartbeatMessage) -> Result<()>;

    /// Wait for the next inbound message.
    ///
    /// Returns `Ok(None)` when the remote side has closed the stream. A frame
    /// that cannot be decoded yields `Err(BeatError::Json)` and leaves the
    /// connection usable. Must be cancellation-safe: dropping the future
    /// before it completes must not lose a message.
    async fn receive(&self, handle: &mut Self::Handle) -> Result<Option<HeartbeatMessage>>;

    /// Close a connection.
    async fn close(&self, handle: Self::Handle) -> Result<()>;
}
