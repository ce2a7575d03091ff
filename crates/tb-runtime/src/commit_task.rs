use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use tb_core::commit::{CommitError, CommitLedger, OffsetStore};
use tb_core::worker::{Progress, ShardReport};

use crate::metrics::GroupMetrics;

const FINAL_COMMIT_ATTEMPTS: u32 = 3;
const FINAL_COMMIT_BACKOFF: Duration = Duration::from_millis(200);

/// Traffic into the commit coordinator of one consumer group.
#[derive(Debug)]
pub(crate) enum CommitMsg {
    Progress(Progress),
    Report(ShardReport),
}

pub(crate) struct CommitTaskConfig {
    pub ledger: CommitLedger,
    pub store: Arc<dyn OffsetStore>,
    pub rx: mpsc::Receiver<CommitMsg>,
    pub commit_interval: Duration,
    pub metrics: Arc<GroupMetrics>,
}

/// Sole writer of the group's checkpoint. Folds reader progress and shard
/// reports into the ledger and saves a checkpoint every `commit_interval`.
/// Runs until every reader and shard has dropped its sender, then makes a
/// final commit.
#[tracing::instrument(
    name = "committer",
    skip_all,
    fields(group = %config.ledger.consumer_group())
)]
pub(crate) async fn run_commit_task(config: CommitTaskConfig) -> anyhow::Result<()> {
    let CommitTaskConfig {
        mut ledger,
        store,
        mut rx,
        commit_interval,
        metrics,
    } = config;

    let mut tick = tokio::time::interval_at(Instant::now() + commit_interval, commit_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(CommitMsg::Progress(progress)) => ledger.observe_progress(&progress),
                Some(CommitMsg::Report(report)) => ledger.apply_report(report),
                None => break,
            },
            _ = tick.tick() => {
                // failures are logged and counted; the next tick retries
                let _ = commit_once(&mut ledger, store.as_ref(), &metrics).await;
            }
        }
    }

    for attempt in 1..=FINAL_COMMIT_ATTEMPTS {
        match commit_once(&mut ledger, store.as_ref(), &metrics).await {
            Ok(_) => break,
            Err(_) if attempt < FINAL_COMMIT_ATTEMPTS => {
                tokio::time::sleep(FINAL_COMMIT_BACKOFF * attempt).await;
            }
            Err(e) => {
                tb_error!(
                    conn,
                    error = %e,
                    "final offset commit failed; uncommitted input will be replayed"
                );
            }
        }
    }
    tb_info!(pipe, "commit coordinator stopped");
    Ok(())
}

/// Save the next checkpoint if any partition can advance. The ledger only
/// adopts it once the store confirms.
pub(crate) async fn commit_once(
    ledger: &mut CommitLedger,
    store: &dyn OffsetStore,
    metrics: &GroupMetrics,
) -> Result<bool, CommitError> {
    let Some(checkpoint) = ledger.prepare() else {
        return Ok(false);
    };
    match store.save(&checkpoint).await {
        Ok(()) => {
            ledger.confirm(&checkpoint);
            metrics.inc_commit();
            let offsets: BTreeMap<_, _> = checkpoint
                .records
                .iter()
                .map(|(p, r)| (*p, r.offset))
                .collect();
            tb_debug!(pipe, ?offsets, "offsets committed");
            Ok(true)
        }
        Err(e) => {
            metrics.inc_commit_failure();
            tb_warn!(conn, error = %e, "offset commit failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use tb_core::commit::MemoryOffsetStore;

    use super::*;
    use crate::metrics::RuntimeMetrics;

    fn metrics() -> Arc<GroupMetrics> {
        RuntimeMetrics::new(&["g".to_string()], 1)
            .group("g")
            .unwrap()
    }

    fn progress(next: i64) -> Progress {
        Progress {
            partition: 0,
            next_offset: next,
            max_event_time: Some(next * 10),
            idle: false,
        }
    }

    fn report(safe: i64) -> ShardReport {
        ShardReport {
            shard: 0,
            safe: [(0, safe)].into_iter().collect(),
            finalized: Vec::new(),
            open_windows: 0,
        }
    }

    // -- 1. unavailable store never advances ---

    #[tokio::test]
    async fn failed_save_keeps_previous_offset() {
        let store = MemoryOffsetStore::new();
        let m = metrics();
        let mut ledger = CommitLedger::new("g", 1);
        ledger.observe_progress(&progress(4));
        ledger.apply_report(report(4));

        store.set_unavailable(true).await;
        assert!(commit_once(&mut ledger, &store, &m).await.is_err());
        assert_eq!(ledger.committed_offset(0), None);
        assert_eq!(store.load("g").await.unwrap(), None);

        store.set_unavailable(false).await;
        assert!(commit_once(&mut ledger, &store, &m).await.unwrap());
        assert_eq!(ledger.committed_offset(0), Some(4));
        assert_eq!(store.load("g").await.unwrap().unwrap().offset(0), Some(4));
        assert!(!commit_once(&mut ledger, &store, &m).await.unwrap());
    }

    // -- 2. channel close triggers final commit ---

    #[tokio::test]
    async fn final_commit_on_close() {
        let store = Arc::new(MemoryOffsetStore::new());
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run_commit_task(CommitTaskConfig {
            ledger: CommitLedger::new("g", 1),
            store: store.clone(),
            rx,
            commit_interval: Duration::from_secs(3600),
            metrics: metrics(),
        }));
        tx.send(CommitMsg::Progress(progress(3))).await.unwrap();
        tx.send(CommitMsg::Report(report(3))).await.unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let cp = store.load("g").await.unwrap().unwrap();
        assert_eq!(cp.offset(0), Some(3));
        assert_eq!(cp.records[&0].max_event_time, Some(30));
    }
}
