//! Configuration for beatpool
//!
//! Configuration is read from `~/.beatpool/config.json` (or an explicit path),
//! then overridden by `BEATPOOL_*` environment variables. Every section uses
//! `#[serde(default)]`, so a partial file, or no file at all, is valid.
//!
//! # Example
//!
//! ```json
//! {
//!     "pool": { "max_cached_connections": 8, "idle_timeout_secs": 600 },
//!     "heartbeat": { "publish_interval_secs": 15, "source": "node-a" },
//!     "logging": { "level": "debug", "format": "json" }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BeatError, Result};

pub const MIN_CACHED_CONNECTIONS: usize = 1;
pub const MAX_CACHED_CONNECTIONS: usize = 20;
pub const MIN_IDLE_TIMEOUT_SECS: u64 = 300;
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 1800;

// ============================================================================
// Pool
// ============================================================================

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on idle plus checked-out connections (clamped to 1..=20).
    pub max_cached_connections: usize,
    /// Idle age after which the reaper closes a connection (clamped to 300..=1800).
    pub idle_timeout_secs: u64,
    /// How often the reaper wakes up.
    pub reaper_interval_secs: u64,
    /// Upper bound on a single liveness probe.
    pub probe_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_cached_connections: 5,
            idle_timeout_secs: 300,
            reaper_interval_secs: 10,
            probe_timeout_ms: 2000,
        }
    }
}

impl PoolConfig {
    /// Clamp every field into its supported range.
    pub fn sanitized(mut self) -> Self {
        let max = self
            .max_cached_connections
            .clamp(MIN_CACHED_CONNECTIONS, MAX_CACHED_CONNECTIONS);
        if max != self.max_cached_connections {
            warn!(
                requested = self.max_cached_connections,
                effective = max,
                "max_cached_connections out of range, clamped"
            );
            self.max_cached_connections = max;
        }

        let idle = self
            .idle_timeout_secs
            .clamp(MIN_IDLE_TIMEOUT_SECS, MAX_IDLE_TIMEOUT_SECS);
        if idle != self.idle_timeout_secs {
            warn!(
                requested = self.idle_timeout_secs,
                effective = idle,
                "idle_timeout_secs out of range, clamped"
            );
            self.idle_timeout_secs = idle;
        }

        self.reaper_interval_secs = self.reaper_interval_secs.max(1);
        self.probe_timeout_ms = self.probe_timeout_ms.max(1);
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Seconds between published heartbeats.
    pub publish_interval_secs: u64,
    /// How long a dispatcher waits for a pooled connection.
    pub acquire_timeout_ms: u64,
    /// Value of the `source` payload field on published heartbeats.
    pub source: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            publish_interval_secs: 30,
            acquire_timeout_ms: 5000,
            source: "beatpool".to_string(),
        }
    }
}

impl HeartbeatConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs.max(1))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = BeatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(BeatError::Config(format!("unknown log format '{}'", other))),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub heartbeat: HeartbeatConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Base directory for beatpool state (`~/.beatpool`).
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".beatpool")
    }

    /// Default config file location.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from the default location, then apply `.env` and environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    /// Load from `path` (missing file means defaults), then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a config file without consulting the environment.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            BeatError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BeatError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply `BEATPOOL_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&lookup, "BEATPOOL_MAX_CACHED_CONNECTIONS")? {
            self.pool.max_cached_connections = v;
        }
        if let Some(v) = parse_env(&lookup, "BEATPOOL_IDLE_TIMEOUT_SECS")? {
            self.pool.idle_timeout_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "BEATPOOL_REAPER_INTERVAL_SECS")? {
            self.pool.reaper_interval_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "BEATPOOL_PUBLISH_INTERVAL_SECS")? {
            self.heartbeat.publish_interval_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "BEATPOOL_ACQUIRE_TIMEOUT_MS")? {
            self.heartbeat.acquire_timeout_ms = v;
        }
        if let Some(v) = lookup("BEATPOOL_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = parse_env(&lookup, "BEATPOOL_LOG_FORMAT")? {
            self.logging.format = v;
        }
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| BeatError::Config(format!("{}: invalid value '{}'", key, raw))),
    }
}
