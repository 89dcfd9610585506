use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Where and how often sessions and retained messages are written.
///
/// Off unless `enabled` is set; state is then memory-only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    /// Store directory
    pub path: PathBuf,
    /// Writer flush cadence ("100ms", "1s")
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Queued writes that force an early flush
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "./data".into(),
            flush_interval: Duration::from_millis(100),
            max_batch_size: 100,
        }
    }
}
