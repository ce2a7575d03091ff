#[macro_use]
mod log_macros;

mod commit_task;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod offset_store;
mod reader_task;
mod shard_task;
pub mod sink_build;
pub mod sink_factory;
pub mod source;
pub mod tracing_init;

pub use lifecycle::{Engine, wait_for_signal};
pub use sink_build::Components;
