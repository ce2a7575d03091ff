use std::path::{Path, PathBuf};

use orion_error::compat_prelude::*;
use orion_error::prelude::*;

use tb_config::{EngineConfig, SourceUri, StartPolicy, parse_source_uri};
use tb_core::commit::{Checkpoint, CommitLedger, OffsetStore};
use tb_core::source::{PartitionId, PartitionReader};
use tb_core::worker::WindowWorker;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::reader_task::PartitionSlot;
use crate::source::{JsonlPartitionReader, partition_path};

use super::types::{GroupPlan, PartitionResume};

/// Directory holding the topic's partition files.
pub(super) fn resolve_source_dir(
    config: &EngineConfig,
    base_dir: &Path,
) -> RuntimeResult<PathBuf> {
    let SourceUri::Jsonl(dir) = parse_source_uri(&config.source.uri).owe_conf()?;
    Ok(if dir.is_relative() {
        base_dir.join(dir)
    } else {
        dir
    })
}

fn resume_point(checkpoint: Option<&Checkpoint>, partition: PartitionId) -> PartitionResume {
    let Some(cp) = checkpoint else {
        return PartitionResume::default();
    };
    match cp.records.get(&partition) {
        Some(record) => PartitionResume {
            next_offset: record.offset,
            max_event_time: record.max_event_time,
            skip: cp.skip_set(partition),
        },
        None => PartitionResume::default(),
    }
}

/// Build the ledger, shard workers and partition readers of one consumer
/// group, resuming from its checkpoint when `start = "committed"`.
pub(super) async fn plan_group(
    config: &EngineConfig,
    name: &str,
    source_dir: &Path,
    offsets: &dyn OffsetStore,
) -> RuntimeResult<GroupPlan> {
    let shards = config.runtime.shards;
    let checkpoint = match config.source.start {
        StartPolicy::Committed => offsets.load(name).await.owe(RuntimeReason::Checkpoint)?,
        StartPolicy::Earliest | StartPolicy::Latest => None,
    };

    let ledger = match &checkpoint {
        Some(cp) => CommitLedger::resume(shards, cp),
        None => CommitLedger::new(name, shards),
    };
    let mut workers: Vec<WindowWorker> = (0..shards)
        .map(|shard| WindowWorker::new(shard, &config.window))
        .collect();

    let partitions = config.source.partitions;
    let reader_count = config.source.parallelism.min(partitions as usize).max(1);
    let mut readers: Vec<Vec<PartitionSlot>> = (0..reader_count).map(|_| Vec::new()).collect();

    for partition in 0..partitions {
        let resume = resume_point(checkpoint.as_ref(), partition);
        let path = partition_path(source_dir, &config.source.topic, partition);
        let mut reader = JsonlPartitionReader::new(partition, path, resume.next_offset);
        if config.source.start == StartPolicy::Latest {
            reader.seek_to_end().await.err_conv()?;
        }
        let start = reader.position();

        for worker in &mut workers {
            worker.register_partition(
                partition,
                start,
                resume.max_event_time,
                resume.skip.clone(),
            );
        }
        tb_debug!(
            sys,
            group = name,
            partition,
            start,
            max_event_time = ?resume.max_event_time,
            skip = resume.skip.len(),
            "partition resume point"
        );
        readers[partition as usize % reader_count].push(PartitionSlot::new(
            Box::new(reader),
            resume.max_event_time,
        ));
    }

    tb_info!(
        sys,
        group = name,
        resumed = checkpoint.is_some(),
        partitions,
        readers = reader_count,
        shards,
        "consumer group planned"
    );
    Ok(GroupPlan {
        name: name.to_string(),
        ledger,
        workers,
        readers,
    })
}
