use serde::Deserialize;

use crate::types::HumanDuration;

// ---------------------------------------------------------------------------
// WindowSection: deserialized from [window]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WindowSection {
    #[serde(default = "default_duration")]
    pub duration: HumanDuration,
    #[serde(default)]
    pub allowed_lateness: Option<HumanDuration>,
    /// Defaults to `allowed_lateness` when omitted.
    #[serde(default)]
    pub watermark_delay: Option<HumanDuration>,
    #[serde(default = "default_count_ceiling")]
    pub count_ceiling: u64,
    #[serde(default = "default_retention")]
    pub retention: HumanDuration,
}

impl Default for WindowSection {
    fn default() -> Self {
        Self {
            duration: default_duration(),
            allowed_lateness: None,
            watermark_delay: None,
            count_ceiling: default_count_ceiling(),
            retention: default_retention(),
        }
    }
}

fn default_duration() -> HumanDuration {
    HumanDuration::from_secs(60)
}

fn default_count_ceiling() -> u64 {
    1000
}

fn default_retention() -> HumanDuration {
    HumanDuration::from_secs(600)
}

// ---------------------------------------------------------------------------
// WindowConfig: fully resolved
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    pub duration: HumanDuration,
    pub allowed_lateness: HumanDuration,
    pub watermark_delay: HumanDuration,
    /// Windows whose final count exceeds this are suppressed.
    pub count_ceiling: u64,
    /// Event-time horizon: an open window whose end trails the highest
    /// event time seen on any partition by more than this is evicted
    /// without being written.
    pub retention: HumanDuration,
}

impl WindowSection {
    pub(crate) fn resolve(self) -> WindowConfig {
        let allowed_lateness = self.allowed_lateness.unwrap_or(HumanDuration::ZERO);
        WindowConfig {
            duration: self.duration,
            allowed_lateness,
            watermark_delay: self.watermark_delay.unwrap_or(allowed_lateness),
            count_ceiling: self.count_ceiling,
            retention: self.retention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_delay_inherits_allowed_lateness() {
        let section = WindowSection {
            allowed_lateness: Some("5s".parse().unwrap()),
            ..WindowSection::default()
        };
        let wc = section.resolve();
        assert_eq!(wc.watermark_delay, HumanDuration::from_secs(5));
        assert_eq!(wc.duration, HumanDuration::from_secs(60));
        assert_eq!(wc.count_ceiling, 1000);
    }

    #[test]
    fn explicit_watermark_delay_wins() {
        let section = WindowSection {
            allowed_lateness: Some("5s".parse().unwrap()),
            watermark_delay: Some("0s".parse().unwrap()),
            ..WindowSection::default()
        };
        let wc = section.resolve();
        assert_eq!(wc.allowed_lateness, HumanDuration::from_secs(5));
        assert!(wc.watermark_delay.is_zero());
    }
}
