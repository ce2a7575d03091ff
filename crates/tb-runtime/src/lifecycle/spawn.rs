use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tb_config::{EngineConfig, MetricsConfig};
use tb_core::event::Normalizer;
use tb_core::finalize::{Finalizer, RetryPolicy};
use tb_core::window::KeyRouter;

use crate::commit_task::{CommitTaskConfig, run_commit_task};
use crate::metrics::{GroupMetrics, RuntimeMetrics, run_metrics_task};
use crate::reader_task::{ReaderTaskConfig, run_reader_task};
use crate::shard_task::{ShardTaskConfig, run_shard_task};
use crate::sink_build::Components;

use super::types::{GroupPlan, TaskGroup};

/// The three pipeline stages, each holding the tasks of every consumer group.
pub(super) struct Stages {
    pub committers: TaskGroup,
    pub shards: TaskGroup,
    pub readers: TaskGroup,
}

impl Stages {
    pub fn new() -> Self {
        Self {
            committers: TaskGroup::new("committers"),
            shards: TaskGroup::new("shards"),
            readers: TaskGroup::new("readers"),
        }
    }
}

/// Shared inputs for spawning one consumer group.
pub(super) struct SpawnCtx<'a> {
    pub config: &'a EngineConfig,
    pub components: &'a Components,
    pub normalizer: Arc<Normalizer>,
    pub metrics: Arc<GroupMetrics>,
    /// Engine root token; readers stop on it, and any failed task trips it.
    pub cancel: &'a CancellationToken,
}

/// Spawn a task that cancels the engine if it fails.
fn spawn_guarded<F>(cancel: &CancellationToken, task: F) -> JoinHandle<anyhow::Result<()>>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let result = task.await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    })
}

pub(super) fn spawn_metrics_task(
    metrics: Arc<RuntimeMetrics>,
    config: &MetricsConfig,
    listener: Option<TcpListener>,
    cancel: CancellationToken,
) -> TaskGroup {
    let mut group = TaskGroup::new("metrics");
    let config = config.clone();
    group.push(tokio::spawn(run_metrics_task(
        metrics, config, listener, cancel,
    )));
    group
}

/// Wire one consumer group: a commit coordinator, one task per shard and
/// `parallelism` readers, connected by bounded channels.
pub(super) fn spawn_group(plan: GroupPlan, ctx: &SpawnCtx<'_>, stages: &mut Stages) {
    let GroupPlan {
        name,
        ledger,
        workers,
        readers,
    } = plan;
    let runtime = &ctx.config.runtime;
    let capacity = runtime.channel_capacity;

    let (commit_tx, commit_rx) = mpsc::channel(capacity);
    stages.committers.push(spawn_guarded(
        ctx.cancel,
        run_commit_task(CommitTaskConfig {
            ledger,
            store: Arc::clone(&ctx.components.offsets),
            rx: commit_rx,
            commit_interval: runtime.commit_interval.as_duration(),
            metrics: Arc::clone(&ctx.metrics),
        }),
    ));

    let mut finalizer = Finalizer::new(
        name.clone(),
        ctx.config.window.count_ceiling,
        Arc::clone(&ctx.components.sink),
        RetryPolicy::from_config(&ctx.config.sink),
    );
    if let Some(dead_letter) = &ctx.components.dead_letter {
        finalizer = finalizer.with_dead_letter(Arc::clone(dead_letter));
    }
    let finalizer = Arc::new(finalizer);

    let mut shard_txs = Vec::with_capacity(workers.len());
    for worker in workers {
        let (tx, rx) = mpsc::channel(capacity);
        shard_txs.push(tx);
        stages.shards.push(spawn_guarded(
            ctx.cancel,
            run_shard_task(ShardTaskConfig {
                group: name.clone(),
                worker,
                finalizer: Arc::clone(&finalizer),
                rx,
                commit_tx: commit_tx.clone(),
                sweep_interval: runtime.batch_interval.as_duration(),
                metrics: Arc::clone(&ctx.metrics),
            }),
        ));
    }

    let router = KeyRouter::new(shard_txs.len());
    for (reader_id, slots) in readers.into_iter().enumerate() {
        stages.readers.push(spawn_guarded(
            ctx.cancel,
            run_reader_task(ReaderTaskConfig {
                group: name.clone(),
                reader_id,
                slots,
                normalizer: Arc::clone(&ctx.normalizer),
                router,
                shard_txs: shard_txs.clone(),
                commit_tx: commit_tx.clone(),
                batch_size: runtime.batch_size,
                batch_interval: runtime.batch_interval.as_duration(),
                idle_timeout: runtime.idle_timeout.as_duration(),
                metrics: Arc::clone(&ctx.metrics),
                cancel: ctx.cancel.child_token(),
            }),
        ));
    }
    // Only the readers and shards hold senders from here on, so each stage
    // sees its channel close once its producers are done.
    drop(shard_txs);
    drop(commit_tx);

    tb_debug!(sys, group = %name, "consumer group tasks spawned");
}
