//! Message types carried between publishers and consumers.

mod message;

pub use message::{HeartbeatMessage, HEARTBEAT_KIND};
