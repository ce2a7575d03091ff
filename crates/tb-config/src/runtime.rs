use std::path::PathBuf;

use serde::Deserialize;

use crate::types::HumanDuration;

/// Task topology and cadence settings (`[runtime]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of window worker shards per consumer group.
    pub shards: usize,
    /// Maximum records a reader pulls from one partition per poll.
    pub batch_size: usize,
    /// Reader back-off when no partition had data, and the shard sweep tick.
    pub batch_interval: HumanDuration,
    pub commit_interval: HumanDuration,
    /// A partition without data for this long is excluded from the combined
    /// watermark.
    pub idle_timeout: HumanDuration,
    /// Bound of each reader → shard channel.
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            batch_size: 6,
            batch_interval: HumanDuration::from_millis(100),
            commit_interval: HumanDuration::from_secs(5),
            idle_timeout: HumanDuration::from_secs(10),
            channel_capacity: 1024,
        }
    }
}

/// Where committed offsets are persisted (`[checkpoint]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Relative paths resolve against the config file's directory.
    pub dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("state/checkpoints"),
        }
    }
}
