//! Telemetry exporter for pool and dispatcher counters.
//!
//! Renders a [`TelemetrySnapshot`] in Prometheus text exposition format or
//! JSON. Rendering only; serving the output is up to the caller.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BeatError;
use crate::heartbeat::DispatchStatsSnapshot;
use crate::pool::{PoolStatsSnapshot, PoolStatus};

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

/// Telemetry output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    #[default]
    Prometheus,
    Json,
}

impl FromStr for TelemetryFormat {
    type Err = BeatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prometheus" | "prom" => Ok(TelemetryFormat::Prometheus),
            "json" => Ok(TelemetryFormat::Json),
            other => Err(BeatError::Config(format!(
                "unknown telemetry format '{}'",
                other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Everything the renderers emit, captured at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub pool: PoolStatsSnapshot,
    pub status: PoolStatus,
    /// Dispatcher counters keyed by a caller-chosen label such as `"publisher"`.
    pub dispatchers: BTreeMap<String, DispatchStatsSnapshot>,
}

impl TelemetrySnapshot {
    pub fn new(pool: PoolStatsSnapshot, status: PoolStatus) -> Self {
        Self {
            pool,
            status,
            dispatchers: BTreeMap::new(),
        }
    }

    pub fn with_dispatcher(mut self, label: &str, stats: DispatchStatsSnapshot) -> Self {
        self.dispatchers.insert(label.to_string(), stats);
        self
    }
}

// ---------------------------------------------------------------------------
// Renderers
// ---------------------------------------------------------------------------

/// Dispatches to the renderer for `format`.
pub fn render(snapshot: &TelemetrySnapshot, format: TelemetryFormat) -> String {
    match format {
        TelemetryFormat::Prometheus => render_prometheus(snapshot),
        TelemetryFormat::Json => render_json(snapshot),
    }
}

fn family(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

/// Renders in Prometheus text exposition format.
///
/// Pool families are `beatpool_pool_*`; dispatcher families are
/// `beatpool_dispatcher_*` with a `dispatcher` label.
pub fn render_prometheus(snapshot: &TelemetrySnapshot) -> String {
    let mut out = String::new();

    let counters: [(&str, &str, u64); 6] = [
        (
            "beatpool_pool_connections_created_total",
            "Connections opened.",
            snapshot.pool.created,
        ),
        (
            "beatpool_pool_connections_closed_total",
            "Connections closed for any reason.",
            snapshot.pool.closed,
        ),
        (
            "beatpool_pool_idle_evicted_total",
            "Idle connections closed by the reaper.",
            snapshot.pool.idle_evicted,
        ),
        (
            "beatpool_pool_exhausted_waits_total",
            "Checkouts that waited for a release.",
            snapshot.pool.exhausted_waits,
        ),
        (
            "beatpool_pool_probe_failures_total",
            "Idle connections that failed the liveness probe.",
            snapshot.pool.probe_failures,
        ),
        (
            "beatpool_pool_creation_failures_total",
            "Failed connection open attempts.",
            snapshot.pool.creation_failures,
        ),
    ];
    for (name, help, value) in counters {
        family(&mut out, name, "counter", help);
        let _ = writeln!(out, "{} {}", name, value);
    }

    let gauges: [(&str, &str, usize); 4] = [
        (
            "beatpool_pool_idle_connections",
            "Connections cached and ready for reuse.",
            snapshot.status.idle,
        ),
        (
            "beatpool_pool_checked_out_connections",
            "Connections currently held by callers.",
            snapshot.status.checked_out,
        ),
        (
            "beatpool_pool_creating_connections",
            "Connections being opened.",
            snapshot.status.creating,
        ),
        (
            "beatpool_pool_max_connections",
            "Configured pool size limit.",
            snapshot.status.max_size,
        ),
    ];
    for (name, help, value) in gauges {
        family(&mut out, name, "gauge", help);
        let _ = writeln!(out, "{} {}", name, value);
    }

    type Field = fn(&DispatchStatsSnapshot) -> u64;
    let dispatcher_counters: [(&str, &str, Field); 6] = [
        (
            "beatpool_dispatcher_published_total",
            "Messages published.",
            |s| s.published,
        ),
        (
            "beatpool_dispatcher_publish_failures_total",
            "Failed publish attempts.",
            |s| s.publish_failures,
        ),
        (
            "beatpool_dispatcher_received_total",
            "Messages received.",
            |s| s.received,
        ),
        (
            "beatpool_dispatcher_dispatched_total",
            "Messages handled successfully.",
            |s| s.dispatched,
        ),
        (
            "beatpool_dispatcher_dropped_total",
            "Messages dropped without a handler or undecodable.",
            |s| s.dropped,
        ),
        (
            "beatpool_dispatcher_handler_errors_total",
            "Handler invocations that failed or panicked.",
            |s| s.handler_errors,
        ),
    ];
    for (name, help, field) in dispatcher_counters {
        family(&mut out, name, "counter", help);
        for (label, stats) in &snapshot.dispatchers {
            let _ = writeln!(
                out,
                "{}{{dispatcher=\"{}\"}} {}",
                name,
                label,
                field(stats)
            );
        }
    }

    out
}

/// Renders the snapshot as pretty-printed JSON.
///
/// ```json
/// {
///   "pool": { "created": 2, "closed": 0, ... },
///   "status": { "idle": 1, "checked_out": 1, "creating": 0, "max_size": 5 },
///   "dispatchers": { "publisher": { "published": 3, ... } }
/// }
/// ```
pub fn render_json(snapshot: &TelemetrySnapshot) -> String {
    serde_json::to_string_pretty(snapshot).unwrap_or_else(|_| "{}".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
