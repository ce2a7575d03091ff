use std::collections::HashSet;

use crate::engine::EngineConfig;

/// Internal validation, called automatically during `EngineConfig::from_str`,
/// `load` and `apply_overrides`.
pub(crate) fn validate(config: &EngineConfig) -> anyhow::Result<()> {
    crate::source::parse_source_uri(&config.source.uri)
        .map_err(|e| anyhow::anyhow!("source.uri: {e}"))?;
    if config.source.partitions == 0 {
        anyhow::bail!("source.partitions must be > 0");
    }
    if config.source.parallelism == 0 {
        anyhow::bail!("source.parallelism must be > 0");
    }
    if !is_valid_name(&config.source.topic) {
        anyhow::bail!(
            "source.topic {:?} must match [A-Za-z0-9_.-]+",
            config.source.topic
        );
    }

    if config.consumer_groups.is_empty() {
        anyhow::bail!("at least one [[consumer_group]] is required");
    }
    let mut seen = HashSet::new();
    for group in &config.consumer_groups {
        if !is_valid_name(&group.name) {
            anyhow::bail!(
                "consumer_group name {:?} must match [A-Za-z0-9_.-]+",
                group.name
            );
        }
        if !seen.insert(group.name.as_str()) {
            anyhow::bail!("duplicate consumer_group name {:?}", group.name);
        }
    }

    if config.window.duration.is_zero() {
        anyhow::bail!("window.duration must be > 0");
    }
    if config.window.retention.is_zero() {
        anyhow::bail!("window.retention must be > 0");
    }

    if config.runtime.shards == 0 {
        anyhow::bail!("runtime.shards must be > 0");
    }
    if config.runtime.batch_size == 0 {
        anyhow::bail!("runtime.batch_size must be > 0");
    }
    if config.runtime.channel_capacity == 0 {
        anyhow::bail!("runtime.channel_capacity must be > 0");
    }
    if config.runtime.batch_interval.is_zero() || config.runtime.commit_interval.is_zero() {
        anyhow::bail!("runtime.batch_interval and runtime.commit_interval must be > 0");
    }

    crate::sink::parse_sink_uri(&config.sink.uri).map_err(|e| anyhow::anyhow!("sink.uri: {e}"))?;
    if config.sink.max_attempts == 0 {
        anyhow::bail!("sink.max_attempts must be > 0");
    }

    if config.metrics.enabled && config.metrics.report_interval.is_zero() {
        anyhow::bail!("metrics.report_interval must be > 0");
    }

    Ok(())
}

/// Group and topic names become file names, so they stay within a safe
/// character set.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert!(is_valid_name("demo-group-1"));
        assert!(is_valid_name("events_multi.v2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a b"));
        assert!(!is_valid_name("../x"));
    }
}
