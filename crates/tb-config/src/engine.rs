use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::logging::LoggingConfig;
use crate::metrics::MetricsConfig;
use crate::runtime::{CheckpointConfig, RuntimeConfig};
use crate::sink::SinkConfig;
use crate::source::SourceConfig;
use crate::types::HumanDuration;
use crate::validate;
use crate::window::{WindowConfig, WindowSection};

// ---------------------------------------------------------------------------
// Raw TOML structure (intermediate representation)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EngineConfigRaw {
    source: SourceConfig,
    #[serde(default, rename = "consumer_group")]
    consumer_groups: Vec<ConsumerGroupConfig>,
    #[serde(default)]
    window: WindowSection,
    #[serde(default)]
    runtime: RuntimeConfig,
    sink: SinkConfig,
    #[serde(default)]
    checkpoint: CheckpointConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

/// One independent pipeline over the same source (`[[consumer_group]]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsumerGroupConfig {
    pub name: String,
}

// ---------------------------------------------------------------------------
// EngineConfig (resolved, validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub source: SourceConfig,
    pub consumer_groups: Vec<ConsumerGroupConfig>,
    pub window: WindowConfig,
    pub runtime: RuntimeConfig,
    pub sink: SinkConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl EngineConfig {
    /// Read and parse a `tumbler.toml` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.as_ref().display()))?;
        content.parse()
    }

    /// Apply command-line / environment overrides and re-validate.
    pub fn apply_overrides(&mut self, ovr: &Overrides) -> anyhow::Result<()> {
        if let Some(shards) = ovr.shards {
            self.runtime.shards = shards;
        }
        if let Some(d) = ovr.window {
            self.window.duration = d;
        }
        if let Some(l) = ovr.allowed_lateness {
            // An inherited watermark delay follows the new lateness.
            if self.window.watermark_delay == self.window.allowed_lateness {
                self.window.watermark_delay = l;
            }
            self.window.allowed_lateness = l;
        }
        if let Some(c) = ovr.count_ceiling {
            self.window.count_ceiling = c;
        }
        if let Some(n) = ovr.batch_size {
            self.runtime.batch_size = n;
        }
        if let Some(d) = ovr.batch_interval {
            self.runtime.batch_interval = d;
        }
        if let Some(d) = ovr.commit_interval {
            self.runtime.commit_interval = d;
        }
        if let Some(p) = ovr.parallelism {
            self.source.parallelism = p;
        }
        if ovr.metrics {
            self.metrics.enabled = true;
        }
        validate::validate(self)
    }
}

/// Optional settings supplied outside the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub shards: Option<usize>,
    pub window: Option<HumanDuration>,
    pub allowed_lateness: Option<HumanDuration>,
    pub count_ceiling: Option<u64>,
    pub batch_size: Option<usize>,
    pub batch_interval: Option<HumanDuration>,
    pub commit_interval: Option<HumanDuration>,
    pub parallelism: Option<usize>,
    pub metrics: bool,
}

impl FromStr for EngineConfig {
    type Err = anyhow::Error;

    /// Parse a TOML string into a resolved, validated [`EngineConfig`].
    fn from_str(toml_str: &str) -> anyhow::Result<Self> {
        let raw: EngineConfigRaw = toml::from_str(toml_str)?;

        let config = EngineConfig {
            source: raw.source,
            consumer_groups: raw.consumer_groups,
            window: raw.window.resolve(),
            runtime: raw.runtime,
            sink: raw.sink,
            checkpoint: raw.checkpoint,
            logging: raw.logging,
            metrics: raw.metrics,
        };

        validate::validate(&config)?;

        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;
    use crate::source::StartPolicy;
    use std::time::Duration;

    const FULL_TOML: &str = r#"
[source]
uri = "jsonl://data/events"
topic = "events"
partitions = 3
parallelism = 3
start = "committed"
timestamp_format = "%Y-%m-%dT%H:%M:%S%.f"

[[consumer_group]]
name = "demo-group-1"

[[consumer_group]]
name = "demo-group-2"

[[consumer_group]]
name = "demo-group-3"

[window]
duration = "1m"
allowed_lateness = "5s"
count_ceiling = 1000
retention = "10m"

[runtime]
shards = 4
batch_size = 6
batch_interval = "100ms"
commit_interval = "5s"
idle_timeout = "10s"

[sink]
uri = "jsonl://out/events_multi_group.jsonl"
max_attempts = 3
dead_letter = "out/dead_letter.jsonl"

[checkpoint]
dir = "state/checkpoints"

[logging]
level = "debug"
format = "json"

[metrics]
enabled = true
listen = "127.0.0.1:9901"
"#;

    const MINIMAL_TOML: &str = r#"
[source]
uri = "jsonl://data"
partitions = 1

[[consumer_group]]
name = "g"

[sink]
uri = "memory://"
"#;

    // -- 1. full config ---

    #[test]
    fn load_full_toml() {
        let cfg: EngineConfig = FULL_TOML.parse().unwrap();

        assert_eq!(cfg.source.partitions, 3);
        assert_eq!(cfg.source.start, StartPolicy::Committed);
        assert_eq!(
            cfg.source.timestamp_format.as_deref(),
            Some("%Y-%m-%dT%H:%M:%S%.f"),
        );
        assert_eq!(cfg.consumer_groups.len(), 3);
        assert_eq!(cfg.consumer_groups[1].name, "demo-group-2");

        assert_eq!(cfg.window.duration.as_duration(), Duration::from_secs(60));
        assert_eq!(cfg.window.allowed_lateness, HumanDuration::from_secs(5));
        assert_eq!(cfg.window.watermark_delay, HumanDuration::from_secs(5));
        assert_eq!(cfg.window.count_ceiling, 1000);

        assert_eq!(cfg.runtime.shards, 4);
        assert_eq!(cfg.runtime.batch_size, 6);
        assert_eq!(cfg.runtime.batch_interval, HumanDuration::from_millis(100));
        assert_eq!(cfg.runtime.channel_capacity, 1024);

        assert_eq!(cfg.sink.max_attempts, 3);
        assert_eq!(cfg.sink.backoff_initial, HumanDuration::from_millis(100));
        assert!(cfg.sink.dead_letter.is_some());

        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.metrics.enabled);
    }

    // -- 2. defaults ---

    #[test]
    fn minimal_toml_uses_defaults() {
        let cfg: EngineConfig = MINIMAL_TOML.parse().unwrap();
        assert_eq!(cfg.source.topic, "events");
        assert_eq!(cfg.source.parallelism, 3);
        assert_eq!(cfg.window.duration, HumanDuration::from_secs(60));
        assert!(cfg.window.allowed_lateness.is_zero());
        assert_eq!(cfg.runtime.shards, 4);
        assert_eq!(cfg.runtime.commit_interval, HumanDuration::from_secs(5));
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.metrics.enabled);
    }

    // -- 3. validation failures ---

    #[test]
    fn reject_zero_shards() {
        let toml = FULL_TOML.replace("shards = 4", "shards = 0");
        let err = toml.parse::<EngineConfig>().unwrap_err();
        assert!(err.to_string().contains("runtime.shards"), "{err}");
    }

    #[test]
    fn reject_zero_window() {
        let toml = FULL_TOML.replace("duration = \"1m\"", "duration = \"0s\"");
        assert!(toml.parse::<EngineConfig>().is_err());
    }

    #[test]
    fn reject_duplicate_group_names() {
        let toml = FULL_TOML.replace("demo-group-3", "demo-group-1");
        let err = toml.parse::<EngineConfig>().unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn reject_missing_groups() {
        let toml = MINIMAL_TOML.replace("[[consumer_group]]\nname = \"g\"\n", "");
        let err = toml.parse::<EngineConfig>().unwrap_err();
        assert!(err.to_string().contains("consumer_group"), "{err}");
    }

    #[test]
    fn reject_bad_group_name() {
        let toml = MINIMAL_TOML.replace("name = \"g\"", "name = \"a/b\"");
        assert!(toml.parse::<EngineConfig>().is_err());
    }

    #[test]
    fn reject_unknown_sink_scheme() {
        let toml = MINIMAL_TOML.replace("memory://", "postgres://localhost/events");
        assert!(toml.parse::<EngineConfig>().is_err());
    }

    #[test]
    fn reject_zero_batch_size() {
        let toml = FULL_TOML.replace("batch_size = 6", "batch_size = 0");
        assert!(toml.parse::<EngineConfig>().is_err());
    }

    // -- 4. overrides ---

    #[test]
    fn overrides_apply_and_revalidate() {
        let mut cfg: EngineConfig = FULL_TOML.parse().unwrap();
        let ovr = Overrides {
            shards: Some(8),
            window: Some(HumanDuration::from_secs(30)),
            allowed_lateness: Some(HumanDuration::from_secs(2)),
            ..Overrides::default()
        };
        cfg.apply_overrides(&ovr).unwrap();
        assert_eq!(cfg.runtime.shards, 8);
        assert_eq!(cfg.window.duration, HumanDuration::from_secs(30));
        assert_eq!(cfg.window.allowed_lateness, HumanDuration::from_secs(2));
        assert_eq!(cfg.window.watermark_delay, HumanDuration::from_secs(2));

        let bad = Overrides {
            shards: Some(0),
            ..Overrides::default()
        };
        assert!(cfg.apply_overrides(&bad).is_err());
    }

    // -- 5. shipped sample ---

    #[test]
    fn sample_config_parses() {
        let cfg: EngineConfig = include_str!("../../../tumbler.toml").parse().unwrap();
        assert_eq!(cfg.consumer_groups.len(), 3);
        assert_eq!(cfg.source.partitions, 3);
        assert!(cfg.metrics.enabled);
    }
}
