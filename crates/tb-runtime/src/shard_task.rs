use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tb_core::event::Event;
use tb_core::finalize::Finalizer;
use tb_core::source::{Offset, PartitionId};
use tb_core::worker::{Admit, Progress, WindowWorker};

use crate::commit_task::CommitMsg;
use crate::metrics::GroupMetrics;

/// Reader → shard traffic. A partition's events and progress markers share
/// one FIFO channel per shard, so a marker always trails its batch.
#[derive(Debug)]
pub(crate) enum ShardMsg {
    Event {
        partition: PartitionId,
        offset: Offset,
        event: Event,
    },
    Progress(Progress),
}

pub(crate) struct ShardTaskConfig {
    pub group: String,
    pub worker: WindowWorker,
    pub finalizer: Arc<Finalizer>,
    pub rx: mpsc::Receiver<ShardMsg>,
    pub commit_tx: mpsc::Sender<CommitMsg>,
    pub sweep_interval: Duration,
    pub metrics: Arc<GroupMetrics>,
}

/// Own one shard's windows until every reader hangs up.
///
/// A sweep runs whenever a progress marker moves the watermark and on every
/// tick, which also retries windows left `Closing`.
/// Each sweep ends with a report to the commit coordinator. When the channel
/// closes, one last sweep closes only what the watermark allows; open
/// windows are left to be rebuilt from uncommitted offsets.
#[tracing::instrument(
    name = "shard",
    skip_all,
    fields(group = %config.group, shard = config.worker.shard())
)]
pub(crate) async fn run_shard_task(config: ShardTaskConfig) -> anyhow::Result<()> {
    let ShardTaskConfig {
        group: _,
        mut worker,
        finalizer,
        mut rx,
        commit_tx,
        sweep_interval,
        metrics,
    } = config;

    let mut tick = tokio::time::interval(sweep_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(ShardMsg::Event { partition, offset, event }) => {
                    match worker.on_event(partition, offset, &event) {
                        Admit::Folded => metrics.inc_folded(),
                        Admit::DroppedLate => {
                            metrics.inc_late_dropped();
                            tb_trace!(
                                pipe,
                                partition,
                                offset,
                                group_key = event.group_key,
                                event_time = event.event_time,
                                "late event dropped"
                            );
                        }
                        Admit::SkippedReplay => metrics.inc_replay_skipped(),
                    }
                }
                Some(ShardMsg::Progress(progress)) => {
                    if worker.on_progress(&progress) {
                        sweep_and_report(&mut worker, &finalizer, &commit_tx, &metrics).await?;
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                sweep_and_report(&mut worker, &finalizer, &commit_tx, &metrics).await?;
            }
        }
    }

    sweep_and_report(&mut worker, &finalizer, &commit_tx, &metrics).await?;
    tb_info!(
        pipe,
        open = worker.open_windows(),
        closing = worker.closing_windows(),
        "shard drained"
    );
    Ok(())
}

async fn sweep_and_report(
    worker: &mut WindowWorker,
    finalizer: &Finalizer,
    commit_tx: &mpsc::Sender<CommitMsg>,
    metrics: &GroupMetrics,
) -> anyhow::Result<()> {
    let report = finalizer.sweep(worker).await;
    metrics.add_sweep(&report);
    metrics.set_shard_windows(worker.shard(), worker.open_windows(), worker.closing_windows());
    if report.closed > 0 || report.expired > 0 || report.retry_pending > 0 {
        tb_debug!(
            pipe,
            watermark = ?worker.watermark(),
            closed = report.closed,
            expired = report.expired,
            written = report.written,
            suppressed = report.suppressed,
            pending = report.retry_pending,
            dead_lettered = report.dead_lettered,
            "window sweep"
        );
    }
    commit_tx
        .send(CommitMsg::Report(worker.take_report()))
        .await
        .map_err(|_| anyhow::anyhow!("commit coordinator stopped"))
}
