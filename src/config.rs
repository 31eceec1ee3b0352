//! Configuration types for the scheduling engine.

use crate::error::{AgendaError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level engine configuration.
///
/// Every section has defaults; a missing or partial file is fine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Appointment database settings.
    pub database: DatabaseConfig,
    /// Notification delivery settings.
    pub notify: NotifyConfig,
}

/// Appointment database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file path.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("agenda.db"),
        }
    }
}

/// Notification delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Capacity of the due-event broadcast channel. Each subscriber gets
    /// its own buffer of this size; slow subscribers lag independently.
    pub due_event_capacity: usize,
    /// Upper bound on a single waiter sleep, in seconds. Longer waits are
    /// chunked so cancellation stays responsive and no single sleep has to
    /// span a multi-year recurrence.
    pub max_sleep_chunk_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            due_event_capacity: 64,
            max_sleep_chunk_secs: 24 * 60 * 60,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| AgendaError::Config(format!("cannot parse {}: {e}", path.display())))
    }
}
