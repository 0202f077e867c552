//! Background task that evicts stale idle connections.

use std::sync::{Arc, Weak};

use tokio::sync::Notify;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::debug;

use crate::transport::Transport;

use super::{PoolInner, PoolStatsSnapshot};

/// Run the reaper until the pool shuts down or every pool handle is dropped.
///
/// Only a `Weak` reference is held between ticks so an abandoned pool can be
/// freed.
pub(super) async fn run<T: Transport>(
    pool: Weak<PoolInner<T>>,
    stop: Arc<Notify>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut last = PoolStatsSnapshot::default();

    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }

        let reaped = inner.reap_idle().await;

        let snapshot = inner.stats.snapshot();
        if snapshot != last {
            debug!(
                reaped,
                created = snapshot.created,
                closed = snapshot.closed,
                idle_evicted = snapshot.idle_evicted,
                exhausted_waits = snapshot.exhausted_waits,
                probe_failures = snapshot.probe_failures,
                creation_failures = snapshot.creation_failures,
                "Pool counters changed"
            );
            last = snapshot;
        }
    }

    debug!("Pool reaper stopped");
}
