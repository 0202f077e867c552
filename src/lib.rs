//! beatpool - bounded transport connection pool with a heartbeat publisher
//! and per-kind message dispatcher.

pub mod bus;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod pool;
pub mod transport;
pub mod utils;

pub use bus::HeartbeatMessage;
pub use config::Config;
pub use error::{BeatError, Result};
pub use heartbeat::{DispatcherMode, DispatcherState, HeartbeatDispatcher, MessageHandler};
pub use pool::{ConnectionPool, PooledConnection};
pub use transport::{LoopbackTransport, TcpTransport, Transport};
