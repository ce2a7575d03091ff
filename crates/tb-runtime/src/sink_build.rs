use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tb_config::{EngineConfig, parse_sink_uri};
use tb_core::commit::OffsetStore;
use tb_core::sink::WindowSink;

use crate::offset_store::FileOffsetStore;
use crate::sink_factory::{
    JsonlSinkFactory, JsonlUpsertSink, MemorySinkFactory, SinkBuildCtx, WindowSinkFactory,
    uri_kind,
};

// ---------------------------------------------------------------------------
// SinkFactoryRegistry
// ---------------------------------------------------------------------------

/// Sink factories keyed by URI scheme.
pub struct SinkFactoryRegistry {
    factories: HashMap<&'static str, Arc<dyn WindowSinkFactory>>,
}

impl SinkFactoryRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in `jsonl` and `memory` factories.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonlSinkFactory));
        registry.register(Arc::new(MemorySinkFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn WindowSinkFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    fn get(&self, kind: &str) -> Option<&Arc<dyn WindowSinkFactory>> {
        self.factories.get(kind)
    }
}

impl Default for SinkFactoryRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// External collaborators of the engine: the result sink, the optional
/// dead-letter sink and the offset store. Shared by every consumer group.
#[derive(Clone)]
pub struct Components {
    pub sink: Arc<dyn WindowSink>,
    pub dead_letter: Option<Arc<dyn WindowSink>>,
    pub offsets: Arc<dyn OffsetStore>,
}

/// Build [`Components`] from config. Relative paths resolve against
/// `base_dir`.
pub async fn build_components(
    config: &EngineConfig,
    registry: &SinkFactoryRegistry,
    base_dir: &Path,
) -> anyhow::Result<Components> {
    let ctx = SinkBuildCtx::new(base_dir);

    let uri = parse_sink_uri(&config.sink.uri)?;
    let factory = registry
        .get(uri_kind(&uri))
        .ok_or_else(|| anyhow::anyhow!("no sink factory registered for {:?}", config.sink.uri))?;
    let sink = factory.build(&uri, &ctx).await?;

    let dead_letter = match &config.sink.dead_letter {
        Some(path) => {
            let dl = JsonlUpsertSink::open(ctx.resolve(path)).await?;
            Some(Arc::new(dl) as Arc<dyn WindowSink>)
        }
        None => None,
    };

    let offsets: Arc<dyn OffsetStore> =
        Arc::new(FileOffsetStore::new(ctx.resolve(&config.checkpoint.dir)));

    tb_debug!(
        conf,
        sink = sink.name(),
        dead_letter = dead_letter.is_some(),
        "sink components built"
    );
    Ok(Components {
        sink,
        dead_letter,
        offsets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML: &str = r#"
[source]
uri = "jsonl://data"
partitions = 1

[[consumer_group]]
name = "g1"

[sink]
uri = "jsonl://out/windows.jsonl"
dead_letter = "out/dead.jsonl"
"#;

    #[tokio::test]
    async fn builds_file_components() {
        let dir = tempfile::tempdir().unwrap();
        let config: EngineConfig = TOML.parse().unwrap();
        let c = build_components(&config, &SinkFactoryRegistry::builtin(), dir.path())
            .await
            .unwrap();
        assert_eq!(c.sink.name(), "jsonl");
        assert!(c.dead_letter.is_some());
        assert!(dir.path().join("out/windows.jsonl").exists());
        assert!(dir.path().join("out/dead.jsonl").exists());
        assert_eq!(c.offsets.load("g1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unregistered_scheme_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config: EngineConfig = TOML
            .replace("jsonl://out/windows.jsonl", "memory://")
            .parse()
            .unwrap();
        assert!(
            build_components(&config, &SinkFactoryRegistry::new(), dir.path())
                .await
                .is_err()
        );
    }
}
