//! TOML configuration for a STRAND node
//!
//! Every section is optional; missing keys take the defaults below.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use strand_core::{StrandError, StrandResult};

/// Top-level configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StrandConfig {
    pub service: ServiceSection,
    pub log: LogConfig,
}

/// `[service]` section
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Period of the per-entity sync loop
    pub sync_interval_ms: u64,
    /// Longest wait for an entity lock
    pub lock_timeout_ms: u64,
    /// Bound of each per-category pending buffer
    pub max_pending_logs: usize,
    /// Lifetime of a freshly created op key
    pub op_key_ttl_secs: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        ServiceSection {
            sync_interval_ms: 5_000,
            lock_timeout_ms: 10_000,
            max_pending_logs: 1024,
            op_key_ttl_secs: 7 * 24 * 3600,
        }
    }
}

/// `[log]` section
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl StrandConfig {
    pub fn from_toml(text: &str) -> StrandResult<Self> {
        toml::from_str(text).map_err(|e| StrandError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> StrandResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StrandError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.service.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.service.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_pending_logs(mut self, max: usize) -> Self {
        self.service.max_pending_logs = max;
        self
    }

    #[inline]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.service.sync_interval_ms)
    }

    #[inline]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.service.lock_timeout_ms)
    }

    #[inline]
    pub fn op_key_ttl(&self) -> Duration {
        Duration::from_secs(self.service.op_key_ttl_secs)
    }
}
