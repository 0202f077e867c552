//! Heartbeat dispatcher: periodic publishing and per-kind message dispatch
//! over a shared connection pool.

mod handler;
mod service;
mod state;

pub use handler::{HandlerRegistry, MessageHandler};
pub use service::{HeartbeatDispatcher, MAX_RECONNECT_ATTEMPTS};
pub use state::{DispatchStatsSnapshot, DispatcherMode, DispatcherState};
