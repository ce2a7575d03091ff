pub mod jsonl;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tb_config::SinkUri;
use tb_core::sink::{MemoryTable, WindowSink};

pub use jsonl::{JsonlSinkFactory, JsonlUpsertSink, load_table};

/// Context handed to every sink factory.
#[derive(Debug, Clone)]
pub struct SinkBuildCtx {
    /// Relative sink paths resolve against this directory.
    pub work_root: PathBuf,
}

impl SinkBuildCtx {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
        }
    }

    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_relative() {
            self.work_root.join(path)
        } else {
            path.to_path_buf()
        }
    }
}

/// Builds a [`WindowSink`] for one URI scheme.
#[async_trait]
pub trait WindowSinkFactory: Send + Sync {
    /// URI scheme this factory serves, e.g. `"jsonl"`.
    fn kind(&self) -> &'static str;

    async fn build(
        &self,
        uri: &SinkUri,
        ctx: &SinkBuildCtx,
    ) -> anyhow::Result<Arc<dyn WindowSink>>;
}

/// `memory://`: an in-process table, mainly for tests and dry runs.
pub struct MemorySinkFactory;

#[async_trait]
impl WindowSinkFactory for MemorySinkFactory {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn build(
        &self,
        uri: &SinkUri,
        _ctx: &SinkBuildCtx,
    ) -> anyhow::Result<Arc<dyn WindowSink>> {
        match uri {
            SinkUri::Memory => Ok(Arc::new(MemoryTable::new())),
            other => anyhow::bail!("memory sink factory cannot build {other:?}"),
        }
    }
}

/// Scheme of a parsed sink URI, used as the factory lookup key.
pub fn uri_kind(uri: &SinkUri) -> &'static str {
    match uri {
        SinkUri::Jsonl(_) => "jsonl",
        SinkUri::Memory => "memory",
    }
}
