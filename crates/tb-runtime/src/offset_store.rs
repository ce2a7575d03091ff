use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use tb_core::commit::{Checkpoint, CommitError, OffsetStore};

/// Keeps one JSON checkpoint per consumer group under a directory:
/// `<dir>/<group>.json`.
///
/// Saves write a temporary file, sync it, then rename it over the old
/// checkpoint, so a crash leaves either the previous or the new checkpoint.
pub struct FileOffsetStore {
    dir: PathBuf,
}

impl FileOffsetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, consumer_group: &str) -> PathBuf {
        self.dir.join(format!("{consumer_group}.json"))
    }
}

fn unavailable(what: &str, path: &Path, e: std::io::Error) -> CommitError {
    CommitError::Unavailable(format!("{what} {}: {e}", path.display()))
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self, consumer_group: &str) -> Result<Option<Checkpoint>, CommitError> {
        let path = self.path_for(consumer_group);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable("read", &path, e)),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| CommitError::Corrupt(format!("{}: {e}", path.display())))?;
        if checkpoint.consumer_group != consumer_group {
            return Err(CommitError::Corrupt(format!(
                "{} belongs to group {:?}",
                path.display(),
                checkpoint.consumer_group
            )));
        }
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CommitError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| unavailable("create", &self.dir, e))?;
        let path = self.path_for(&checkpoint.consumer_group);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| CommitError::Corrupt(e.to_string()))?;

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| unavailable("create", &tmp, e))?;
        file.write_all(&body)
            .await
            .map_err(|e| unavailable("write", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| unavailable("sync", &tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| unavailable("rename", &path, e))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tb_core::commit::{CommitRecord, FinalizedId};
    use tb_core::window::WindowKey;

    use super::*;

    fn sample(group: &str) -> Checkpoint {
        let mut cp = Checkpoint::new(group);
        let mut finalized = BTreeSet::new();
        finalized.insert(FinalizedId {
            window: WindowKey {
                group_key: 42,
                window_start: 0,
                window_end: 60_000_000_000,
            },
            last_offset: 7,
        });
        cp.records.insert(
            1,
            CommitRecord {
                partition: 1,
                offset: 5,
                max_event_time: Some(61_000_000_000),
                finalized_window_ids: finalized,
            },
        );
        cp
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileOffsetStore::new(dir.path());
        assert_eq!(store.load("demo-group-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileOffsetStore::new(dir.path().join("nested"));
        let cp = sample("demo-group-1");
        store.save(&cp).await.unwrap();
        assert_eq!(store.load("demo-group-1").await.unwrap(), Some(cp.clone()));
        assert!(!store.dir().join("demo-group-1.json.tmp").exists());

        // groups are independent
        assert_eq!(store.load("demo-group-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("g.json"), b"{not json").unwrap();
        let store = FileOffsetStore::new(dir.path());
        assert!(matches!(
            store.load("g").await,
            Err(CommitError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn mismatched_group_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileOffsetStore::new(dir.path());
        store.save(&sample("a")).await.unwrap();
        std::fs::rename(dir.path().join("a.json"), dir.path().join("b.json")).unwrap();
        assert!(matches!(
            store.load("b").await,
            Err(CommitError::Corrupt(_))
        ));
    }
}
