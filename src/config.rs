//! Driver configuration.
//!
//! All tunable values live in a single [`DriverConfig`] struct that is
//! threaded through [`AriesManager`](crate::controller::AriesManager) at
//! construction time. Defaults match the controller's recommended settings;
//! hosts can override individual fields in code or load the whole struct from
//! a TOML file via [`DriverConfig::from_file`].
//!
//! After loading, [`DriverConfig::validate`] performs semantic checks (empty
//! host, zero port, degenerate intervals) so that misconfiguration is caught
//! at startup rather than as a runtime failure.

use crate::error::{AriesError, AriesResult};
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;

/// Default response wait for synchronous requests (ms).
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 60_000;
/// Default cadence for polling idle axes (ms).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
/// Default cadence for polling axes with an outstanding operation (ms).
pub const DEFAULT_FAST_POLL_INTERVAL_MS: u64 = 100;
/// Default bound on the outbound writer queue.
pub const DEFAULT_WRITER_MAX_QUEUE: usize = 1000;
/// Default delay between reconnect attempts (ms).
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;

/// Configuration for one ARIES/LYNX connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Controller hostname or IP address.
    pub host: String,
    /// Controller TCP port.
    pub port: u16,
    /// Keep a background task reconnecting whenever the link drops.
    pub auto_reconnect: bool,
    /// Bounded wait for `send_sync` replies, in milliseconds.
    pub response_timeout_ms: u64,
    /// Idle-axis poll cadence, in milliseconds.
    pub poll_interval_ms: u64,
    /// Active-axis poll cadence, in milliseconds.
    pub fast_poll_interval_ms: u64,
    /// Maximum number of queued outbound lines before enqueue fails.
    pub writer_max_queue: usize,
    /// Delay between reconnect attempts, in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Prefix outbound lines with STX (0x02). Most firmware accepts either;
    /// off by default.
    pub include_stx: bool,
    /// Command mnemonics that trigger operation-lifecycle bookkeeping
    /// (fast polling plus final reads). Extend this when the host uses
    /// additional motion commands such as `ORG`.
    pub movement_commands: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.120".to_string(),
            port: 12321,
            auto_reconnect: false,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            fast_poll_interval_ms: DEFAULT_FAST_POLL_INTERVAL_MS,
            writer_max_queue: DEFAULT_WRITER_MAX_QUEUE,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            include_stx: false,
            movement_commands: vec!["APS".into(), "RPS".into(), "MPS".into()],
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .with_context(|| format!("failed to read driver configuration '{path}'"))?;
        let cfg: DriverConfig = raw
            .try_deserialize()
            .context("invalid driver configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation of loaded values.
    pub fn validate(&self) -> AriesResult<()> {
        if self.host.trim().is_empty() {
            return Err(AriesError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(AriesError::Config("port must be nonzero".into()));
        }
        if self.writer_max_queue == 0 {
            return Err(AriesError::Config(
                "writer_max_queue must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 || self.fast_poll_interval_ms == 0 {
            return Err(AriesError::Config(
                "poll intervals must be nonzero".into(),
            ));
        }
        if self.fast_poll_interval_ms > self.poll_interval_ms {
            return Err(AriesError::Config(
                "fast_poll_interval_ms must not exceed poll_interval_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fast_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fast_poll_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}
