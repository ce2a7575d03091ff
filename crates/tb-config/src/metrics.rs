use serde::Deserialize;

use crate::types::HumanDuration;

/// Pipeline metrics settings.
///
/// Counters are always collected; `enabled` switches on the periodic summary
/// log and the Prometheus text endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_report_interval")]
    pub report_interval: HumanDuration,
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_report_interval() -> HumanDuration {
    HumanDuration::from_secs(10)
}

fn default_listen() -> String {
    "127.0.0.1:9901".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            report_interval: default_report_interval(),
            listen: default_listen(),
        }
    }
}
