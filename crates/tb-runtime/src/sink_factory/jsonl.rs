use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use tb_config::SinkUri;
use tb_core::sink::{RowKey, SinkError, WindowRow, WindowSink};

use super::{SinkBuildCtx, WindowSinkFactory};

// ---------------------------------------------------------------------------
// JsonlSinkFactory
// ---------------------------------------------------------------------------

/// `jsonl://<path>`: an append-only upsert log.
pub struct JsonlSinkFactory;

#[async_trait]
impl WindowSinkFactory for JsonlSinkFactory {
    fn kind(&self) -> &'static str {
        "jsonl"
    }

    async fn build(
        &self,
        uri: &SinkUri,
        ctx: &SinkBuildCtx,
    ) -> anyhow::Result<Arc<dyn WindowSink>> {
        match uri {
            SinkUri::Jsonl(path) => {
                let sink = JsonlUpsertSink::open(ctx.resolve(path)).await?;
                Ok(Arc::new(sink))
            }
            other => anyhow::bail!("jsonl sink factory cannot build {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// JsonlUpsertSink
// ---------------------------------------------------------------------------

/// Appends every upserted row as one JSON line. The logical table is the
/// last line per [`RowKey`], as rebuilt by [`load_table`], so rewriting a
/// row is idempotent.
///
/// Each upsert is flushed and synced before it returns.
pub struct JsonlUpsertSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlUpsertSink {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                anyhow::anyhow!("failed to create directory {}: {e}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open {}: {e}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn transient(what: &str, e: std::io::Error) -> SinkError {
    SinkError::Transient(format!("{what}: {e}"))
}

#[async_trait]
impl WindowSink for JsonlUpsertSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn upsert(&self, row: &WindowRow) -> Result<(), SinkError> {
        let mut line =
            serde_json::to_vec(row).map_err(|e| SinkError::Permanent(e.to_string()))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| transient("write row", e))?;
        writer.flush().await.map_err(|e| transient("flush", e))?;
        writer
            .get_ref()
            .sync_data()
            .await
            .map_err(|e| transient("sync", e))
    }

    async fn close(&self) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().await;
        writer.flush().await.map_err(|e| transient("flush on close", e))?;
        writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| transient("sync on close", e))
    }
}

/// Rebuild the table a jsonl sink file describes: the last row written for
/// each key wins. Lines that do not parse (a write torn by a crash) are
/// skipped and counted.
pub fn load_table(path: &Path) -> anyhow::Result<(BTreeMap<RowKey, WindowRow>, usize)> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let mut table = BTreeMap::new();
    let mut skipped = 0;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<WindowRow>(line) {
            Ok(row) => {
                table.insert(row.key(), row);
            }
            Err(_) => skipped += 1,
        }
    }
    Ok((table, skipped))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;

    fn row(group: &str, user: i64, count: u64) -> WindowRow {
        WindowRow {
            consumer_group: group.to_string(),
            user_id: user,
            window_start: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            window_end: DateTime::<Utc>::from_timestamp(60, 0).unwrap(),
            count,
            total_value: count as f64 * 1.5,
            event_hash: format!("{user}_2026-03-02T10:00:00Z"),
        }
    }

    #[tokio::test]
    async fn last_write_per_key_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/windows.jsonl");
        let sink = JsonlUpsertSink::open(&path).await.unwrap();

        sink.upsert(&row("g1", 42, 1)).await.unwrap();
        sink.upsert(&row("g1", 42, 3)).await.unwrap();
        sink.upsert(&row("g2", 42, 2)).await.unwrap();
        sink.close().await.unwrap();

        let (table, skipped) = load_table(&path).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(table.len(), 2);
        assert_eq!(table[&row("g1", 42, 0).key()].count, 3);
        assert_eq!(table[&row("g2", 42, 0).key()].count, 2);
    }

    #[tokio::test]
    async fn torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("windows.jsonl");
        {
            let sink = JsonlUpsertSink::open(&path).await.unwrap();
            sink.upsert(&row("g1", 7, 4)).await.unwrap();
        }
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"consumer_group\":\"g1\",\"us");
        std::fs::write(&path, text).unwrap();

        let (table, skipped) = load_table(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn factory_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SinkBuildCtx::new(dir.path());
        let sink = JsonlSinkFactory
            .build(&SinkUri::Jsonl(PathBuf::from("rel/out.jsonl")), &ctx)
            .await
            .unwrap();
        sink.upsert(&row("g1", 1, 1)).await.unwrap();
        assert!(dir.path().join("rel/out.jsonl").exists());
        assert!(JsonlSinkFactory.build(&SinkUri::Memory, &ctx).await.is_err());
    }
}
