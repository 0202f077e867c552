//! Message handlers and the per-kind registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::HeartbeatMessage;
use crate::error::Result;

/// Callback invoked by a consumer for every message of a registered kind.
///
/// Returning an error (or panicking) is logged by the consumer and does not
/// stop the listen loop.
///
/// Plain closures work too:
///
/// ```rust,ignore
/// consumer.register_handler("heartbeat", |msg: &HeartbeatMessage| -> Result<()> {
///     println!("beat {}", msg.id());
///     Ok(())
/// })?;
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &HeartbeatMessage) -> Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&HeartbeatMessage) -> Result<()> + Send + Sync,
{
    async fn handle(&self, message: &HeartbeatMessage) -> Result<()> {
        self(message)
    }
}

/// At most one handler per message kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, returning the handler it replaced.
    pub fn insert(
        &mut self,
        kind: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.insert(kind.to_string(), handler)
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
