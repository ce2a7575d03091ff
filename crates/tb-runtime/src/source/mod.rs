pub mod jsonl;

use std::path::{Path, PathBuf};

use tb_core::source::PartitionId;

pub use jsonl::JsonlPartitionReader;

/// File backing one partition of a `jsonl://` topic directory:
/// `<dir>/<topic>-<partition>.jsonl`.
pub fn partition_path(dir: &Path, topic: &str, partition: PartitionId) -> PathBuf {
    dir.join(format!("{topic}-{partition}.jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_file_naming() {
        assert_eq!(
            partition_path(Path::new("/data"), "events", 2),
            PathBuf::from("/data/events-2.jsonl")
        );
    }
}
