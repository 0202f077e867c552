//! Newline-delimited JSON over TCP.
//!
//! Each connection is a plain `TcpStream`; every message is one JSON frame
//! followed by `\n`. Any line-oriented endpoint (a relay, a test harness,
//! `nc -lk`) can sit on the other side.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::bus::HeartbeatMessage;
use crate::error::{BeatError, Result};

use super::Transport;

/// Upper bound on a single buffered frame.
const MAX_FRAME_LEN: usize = 1024 * 1024;

const READ_CHUNK_SIZE: usize = 4096;

/// Connection handle issued by [`TcpTransport`].
#[derive(Debug)]
pub struct TcpHandle {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    /// Bytes read but not yet consumed as a full frame.
    pending: Vec<u8>,
    peer: SocketAddr,
}

impl TcpHandle {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Pop one complete line from the pending buffer, if any.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        Some(self.pending.drain(..=pos).collect())
    }
}

/// TCP transport dialing a fixed address.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Handle = TcpHandle;

    fn name(&self) -> &str {
        "tcp"
    }

    async fn open(&self) -> Result<TcpHandle> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                BeatError::Transport(format!(
                    "connect to {} timed out after {:?}",
                    self.addr, self.connect_timeout
                ))
            })??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        debug!(peer = %peer, "TCP connection opened");
        Ok(TcpHandle {
            reader,
            writer,
            pending: Vec::new(),
            peer,
        })
    }

    /// Non-blocking peek: pending data or "would block" means the socket is
    /// healthy, EOF or an error means it is gone.
    async fn ping(&self, handle: &mut TcpHandle) -> bool {
        if !handle.pending.is_empty() {
            return true;
        }
        let mut probe = [0u8; 1];
        match handle.reader.peek(&mut probe).now_or_never() {
            None => true,
            Some(Ok(0)) => false,
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                trace!(peer = %handle.peer, error = %e, "TCP probe failed");
                false
            }
        }
    }

    async fn send(&self, handle: &mut TcpHandle, message: &HeartbeatMessage) -> Result<()> {
        let mut frame = message.to_frame()?;
        frame.push('\n');
        handle.writer.write_all(frame.as_bytes()).await?;
        handle.writer.flush().await?;
        Ok(())
    }

    async fn receive(&self, handle: &mut TcpHandle) -> Result<Option<HeartbeatMessage>> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(line) = handle.take_line() {
                let text = String::from_utf8_lossy(&line);
                if text.trim().is_empty() {
                    continue;
                }
                return HeartbeatMessage::from_frame(&text).map(Some);
            }

            // `read` is cancellation-safe; partial frames live in `pending`.
            let n = handle.reader.read(&mut chunk).await?;
            if n == 0 {
                if !handle.pending.is_empty() {
                    debug!(
                        peer = %handle.peer,
                        bytes = handle.pending.len(),
                        "TCP stream closed with a partial frame"
                    );
                }
                return Ok(None);
            }
            handle.pending.extend_from_slice(&chunk[..n]);
            if handle.pending.len() > MAX_FRAME_LEN {
                handle.pending.clear();
                return Err(BeatError::Transport(format!(
                    "frame from {} exceeds {} bytes",
                    handle.peer, MAX_FRAME_LEN
                )));
            }
        }
    }

    async fn close(&self, mut handle: TcpHandle) -> Result<()> {
        let peer = handle.peer;
        handle.writer.shutdown().await?;
        debug!(peer = %peer, "TCP connection closed");
        Ok(())
    }
}
