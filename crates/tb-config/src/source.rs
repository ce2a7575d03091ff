use std::path::PathBuf;

use serde::Deserialize;

/// Partitioned event source (`[source]`).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub uri: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    pub partitions: u32,
    /// Number of reader tasks per consumer group. Partitions are assigned
    /// round-robin.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub start: StartPolicy,
    /// Explicit chrono pattern for the `timestamp` field. ISO-8601 otherwise.
    #[serde(default)]
    pub timestamp_format: Option<String>,
}

fn default_topic() -> String {
    "events".to_string()
}

fn default_parallelism() -> usize {
    3
}

/// Where a consumer group starts reading when it boots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    /// Resume at the committed offset; `earliest` when nothing is committed.
    #[default]
    Committed,
    Earliest,
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceUri {
    /// Directory of `<topic>-<partition>.jsonl` files.
    Jsonl(PathBuf),
}

pub fn parse_source_uri(uri: &str) -> anyhow::Result<SourceUri> {
    if let Some(path) = uri.strip_prefix("jsonl://") {
        if path.is_empty() {
            anyhow::bail!("jsonl:// source URI has an empty path");
        }
        return Ok(SourceUri::Jsonl(PathBuf::from(path)));
    }
    anyhow::bail!("unsupported source URI scheme: {uri:?} (expected jsonl://)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_jsonl_source() {
        assert_eq!(
            parse_source_uri("jsonl://data/events").unwrap(),
            SourceUri::Jsonl(PathBuf::from("data/events")),
        );
    }

    #[test]
    fn reject_unknown_scheme() {
        assert!(parse_source_uri("kafka://localhost:9092").is_err());
        assert!(parse_source_uri("jsonl://").is_err());
    }
}
