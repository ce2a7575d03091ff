use std::path::PathBuf;

use serde::Deserialize;

use crate::types::HumanDuration;

/// Result table shared by every consumer group (`[sink]`).
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub uri: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial: HumanDuration,
    #[serde(default = "default_backoff_max")]
    pub backoff_max: HumanDuration,
    /// JSON Lines file receiving windows the sink rejected permanently.
    #[serde(default)]
    pub dead_letter: Option<PathBuf>,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_initial() -> HumanDuration {
    HumanDuration::from_millis(100)
}

fn default_backoff_max() -> HumanDuration {
    HumanDuration::from_secs(5)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkUri {
    /// Append-only upsert log; the last row per key wins.
    Jsonl(PathBuf),
    Memory,
}

pub fn parse_sink_uri(uri: &str) -> anyhow::Result<SinkUri> {
    if uri == "memory://" {
        return Ok(SinkUri::Memory);
    }
    if let Some(path) = uri.strip_prefix("jsonl://") {
        if path.is_empty() {
            anyhow::bail!("jsonl:// sink URI has an empty path");
        }
        return Ok(SinkUri::Jsonl(PathBuf::from(path)));
    }
    anyhow::bail!("unsupported sink URI scheme: {uri:?} (expected jsonl:// or memory://)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sink_uris() {
        assert_eq!(parse_sink_uri("memory://").unwrap(), SinkUri::Memory);
        assert_eq!(
            parse_sink_uri("jsonl://out/events.jsonl").unwrap(),
            SinkUri::Jsonl(PathBuf::from("out/events.jsonl")),
        );
        assert!(parse_sink_uri("postgres://db/events").is_err());
    }
}
