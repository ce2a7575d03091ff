pub mod engine;
pub mod logging;
pub mod metrics;
pub mod runtime;
pub mod sink;
pub mod source;
pub mod types;
pub mod validate;
pub mod window;

pub use engine::{ConsumerGroupConfig, EngineConfig, Overrides};
pub use logging::{LogFormat, LoggingConfig};
pub use metrics::MetricsConfig;
pub use runtime::{CheckpointConfig, RuntimeConfig};
pub use sink::{SinkConfig, SinkUri, parse_sink_uri};
pub use source::{SourceConfig, SourceUri, StartPolicy, parse_source_uri};
pub use types::HumanDuration;
pub use window::WindowConfig;
