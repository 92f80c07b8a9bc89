//! Engine configuration, loadable from TOML.
//!
//! ```toml
//! busy_timeout_ms = 5000
//! heartbeat_interval_ms = 20000
//! active_threshold_ms = 60000
//! stale_threshold_ms = 300000
//! master_eligible = ["desktop"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::sessions::ClientKind;

/// Tunables for the connection pool, session maintenance and trigger queue.
///
/// # Invariants
/// - `heartbeat_interval_ms < active_threshold_ms < stale_threshold_ms`.
/// - `master_eligible` is not empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Idle connections kept by the pool.
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
    /// Interval at which clients refresh their session row.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A master whose heartbeat is older than this loses the flag.
    #[serde(default = "default_active_threshold_ms")]
    pub active_threshold_ms: u64,
    /// A session whose heartbeat is older than this is evicted.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    /// Age after which a doc-ignore entry stops suppressing triggers.
    #[serde(default = "default_doc_ignore_horizon_ms")]
    pub doc_ignore_horizon_ms: u64,
    /// Client kinds allowed to hold the master flag.
    #[serde(default = "default_master_eligible")]
    pub master_eligible: Vec<ClientKind>,
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_max_idle_connections() -> usize {
    8
}

const fn default_heartbeat_interval_ms() -> u64 {
    20_000
}

const fn default_active_threshold_ms() -> u64 {
    60_000
}

const fn default_stale_threshold_ms() -> u64 {
    300_000
}

const fn default_doc_ignore_horizon_ms() -> u64 {
    600_000
}

fn default_master_eligible() -> Vec<ClientKind> {
    vec![ClientKind::Desktop]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            max_idle_connections: default_max_idle_connections(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            active_threshold_ms: default_active_threshold_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
            doc_ignore_horizon_ms: default_doc_ignore_horizon_ms(),
            master_eligible: default_master_eligible(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.busy_timeout_ms == 0 {
            return Err(EngineError::Config("busy_timeout_ms must be > 0".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(EngineError::Config("heartbeat_interval_ms must be > 0".into()));
        }
        if self.heartbeat_interval_ms >= self.active_threshold_ms {
            return Err(EngineError::Config(format!(
                "heartbeat_interval_ms ({}) must be below active_threshold_ms ({})",
                self.heartbeat_interval_ms, self.active_threshold_ms
            )));
        }
        if self.active_threshold_ms >= self.stale_threshold_ms {
            return Err(EngineError::Config(format!(
                "active_threshold_ms ({}) must be below stale_threshold_ms ({})",
                self.active_threshold_ms, self.stale_threshold_ms
            )));
        }
        if self.doc_ignore_horizon_ms == 0 {
            return Err(EngineError::Config("doc_ignore_horizon_ms must be > 0".into()));
        }
        if self.master_eligible.is_empty() {
            return Err(EngineError::Config(
                "master_eligible must name at least one client kind".into(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn is_master_eligible(&self, kind: ClientKind) -> bool {
        self.master_eligible.contains(&kind)
    }
}
