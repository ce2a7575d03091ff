use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tb_core::event::Normalizer;
use tb_core::source::{PartitionId, PartitionReader};
use tb_core::window::KeyRouter;
use tb_core::worker::Progress;

use crate::commit_task::CommitMsg;
use crate::metrics::GroupMetrics;
use crate::shard_task::ShardMsg;

/// One partition cursor owned by a reader task.
pub(crate) struct PartitionSlot {
    pub reader: Box<dyn PartitionReader>,
    /// Running max event time, seeded from the checkpoint on restart.
    pub max_event_time: Option<i64>,
    idle: bool,
    last_data: Instant,
}

impl PartitionSlot {
    pub fn new(reader: Box<dyn PartitionReader>, max_event_time: Option<i64>) -> Self {
        Self {
            reader,
            max_event_time,
            idle: false,
            last_data: Instant::now(),
        }
    }

    fn progress(&self) -> Progress {
        Progress {
            partition: self.reader.partition(),
            next_offset: self.reader.position(),
            max_event_time: self.max_event_time,
            idle: self.idle,
        }
    }
}

pub(crate) struct ReaderTaskConfig {
    pub group: String,
    pub reader_id: usize,
    pub slots: Vec<PartitionSlot>,
    pub normalizer: Arc<Normalizer>,
    pub router: KeyRouter,
    pub shard_txs: Vec<mpsc::Sender<ShardMsg>>,
    pub commit_tx: mpsc::Sender<CommitMsg>,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub idle_timeout: Duration,
    pub metrics: Arc<GroupMetrics>,
    pub cancel: CancellationToken,
}

struct ReaderTask {
    normalizer: Arc<Normalizer>,
    router: KeyRouter,
    shard_txs: Vec<mpsc::Sender<ShardMsg>>,
    commit_tx: mpsc::Sender<CommitMsg>,
    metrics: Arc<GroupMetrics>,
}

impl ReaderTask {
    /// Progress goes to the committer before the shards so every boundary a
    /// shard can report against is already known to the ledger.
    async fn broadcast(&self, progress: Progress) -> anyhow::Result<()> {
        self.commit_tx
            .send(CommitMsg::Progress(progress))
            .await
            .map_err(|_| anyhow::anyhow!("commit coordinator stopped"))?;
        for tx in &self.shard_txs {
            tx.send(ShardMsg::Progress(progress))
                .await
                .map_err(|_| anyhow::anyhow!("shard worker stopped"))?;
        }
        Ok(())
    }

    /// Poll one partition. Returns whether any record was read.
    async fn pump(
        &self,
        slot: &mut PartitionSlot,
        batch_size: usize,
        idle_timeout: Duration,
    ) -> anyhow::Result<bool> {
        let partition = slot.reader.partition();
        let batch = match slot.reader.poll(batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                self.metrics.inc_read_error();
                tb_warn!(conn, partition, error = %e, "partition read failed");
                return Ok(false);
            }
        };

        if batch.is_empty() {
            if !slot.idle && slot.last_data.elapsed() >= idle_timeout {
                slot.idle = true;
                tb_debug!(pipe, partition, "partition idle");
                self.broadcast(slot.progress()).await?;
            }
            return Ok(false);
        }

        slot.idle = false;
        slot.last_data = Instant::now();
        self.metrics.add_records_read(batch.len());

        for record in batch {
            let event = match self.normalizer.normalize(&record.payload) {
                Ok(event) => event,
                Err(e) => {
                    self.metrics.inc_parse_error();
                    tb_debug!(
                        pipe,
                        partition,
                        offset = record.offset,
                        kind = e.kind(),
                        error = %e,
                        "dropping malformed record"
                    );
                    continue;
                }
            };
            slot.max_event_time = Some(
                slot.max_event_time
                    .map_or(event.event_time, |m| m.max(event.event_time)),
            );
            let shard = self.router.shard_for(event.group_key);
            self.shard_txs[shard]
                .send(ShardMsg::Event {
                    partition,
                    offset: record.offset,
                    event,
                })
                .await
                .map_err(|_| anyhow::anyhow!("shard worker {shard} stopped"))?;
        }

        self.broadcast(slot.progress()).await?;
        Ok(true)
    }
}

/// Read the partitions assigned to this task round-robin, fan events out to
/// their owning shards and follow every batch with a progress marker.
#[tracing::instrument(
    name = "reader",
    skip_all,
    fields(group = %config.group, reader = config.reader_id)
)]
pub(crate) async fn run_reader_task(config: ReaderTaskConfig) -> anyhow::Result<()> {
    let ReaderTaskConfig {
        group: _,
        reader_id: _,
        mut slots,
        normalizer,
        router,
        shard_txs,
        commit_tx,
        batch_size,
        batch_interval,
        idle_timeout,
        metrics,
        cancel,
    } = config;
    let task = ReaderTask {
        normalizer,
        router,
        shard_txs,
        commit_tx,
        metrics,
    };

    let positions: BTreeMap<PartitionId, i64> = slots
        .iter()
        .map(|s| (s.reader.partition(), s.reader.position()))
        .collect();
    tb_info!(conn, ?positions, "reader started");
    for i in 0..slots.len() {
        let progress = slots[i].progress();
        task.broadcast(progress).await?;
    }

    while !cancel.is_cancelled() {
        let mut any = false;
        for slot in &mut slots {
            any |= task.pump(slot, batch_size, idle_timeout).await?;
        }
        if !any {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(batch_interval) => {}
            }
        }
    }

    tb_info!(conn, "reader stopped");
    Ok(())
}
