mod bootstrap;
mod signal;
mod spawn;
mod types;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use orion_error::op_context;
use orion_error::compat_prelude::*;
use orion_error::prelude::*;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tb_config::EngineConfig;
use tb_core::event::Normalizer;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::RuntimeMetrics;
use crate::sink_build::{Components, SinkFactoryRegistry, build_components};

pub use signal::wait_for_signal;

use bootstrap::{plan_group, resolve_source_dir};
use spawn::{SpawnCtx, Stages, spawn_group, spawn_metrics_task};
use types::TaskGroup;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Running aggregation engine: one reader → shard → committer pipeline per
/// consumer group, all sharing one sink and one offset store.
///
/// Shutdown is cooperative. [`shutdown`](Self::shutdown) stops the readers;
/// [`wait`](Self::wait) then joins the stages in reverse start order so every
/// shard drains its channel and reports before the committers make their
/// final save. Sinks are closed last.
pub struct Engine {
    cancel: CancellationToken,
    metrics_cancel: CancellationToken,
    groups: Vec<TaskGroup>,
    components: Components,
    metrics: Arc<RuntimeMetrics>,
    metrics_addr: Option<SocketAddr>,
}

impl Engine {
    /// Bootstrap from config, building the sink and offset store it names.
    /// Relative paths resolve against `base_dir`.
    pub async fn start(config: EngineConfig, base_dir: &Path) -> RuntimeResult<Self> {
        let components = build_components(&config, &SinkFactoryRegistry::builtin(), base_dir)
            .await
            .owe(RuntimeReason::Bootstrap)?;
        Self::start_with(config, base_dir, components).await
    }

    /// Bootstrap with caller-supplied sink and offset store.
    #[tracing::instrument(name = "engine.start", skip_all, fields(source = %config.source.uri))]
    pub async fn start_with(
        config: EngineConfig,
        base_dir: &Path,
        components: Components,
    ) -> RuntimeResult<Self> {
        let mut op = op_context!("engine-bootstrap").with_auto_log();
        op.record("source", config.source.uri.as_str());
        op.record("base_dir", base_dir.display().to_string().as_str());

        let cancel = CancellationToken::new();
        let metrics_cancel = CancellationToken::new();
        let source_dir = resolve_source_dir(&config, base_dir)?;

        let group_names: Vec<String> = config
            .consumer_groups
            .iter()
            .map(|g| g.name.clone())
            .collect();
        let metrics = Arc::new(RuntimeMetrics::new(&group_names, config.runtime.shards));

        let mut plans = Vec::with_capacity(group_names.len());
        for name in &group_names {
            let plan = plan_group(&config, name, &source_dir, components.offsets.as_ref()).await?;
            plans.push(plan);
        }

        // start order: metrics → committers → shards → readers
        let mut groups: Vec<TaskGroup> = Vec::with_capacity(4);
        let mut metrics_addr = None;
        if config.metrics.enabled {
            let listener = TcpListener::bind(config.metrics.listen.as_str()).await.owe_sys()?;
            metrics_addr = Some(listener.local_addr().owe_sys()?);
            groups.push(spawn_metrics_task(
                Arc::clone(&metrics),
                &config.metrics,
                Some(listener),
                metrics_cancel.clone(),
            ));
        }

        let normalizer = Arc::new(Normalizer::new(config.source.timestamp_format.clone()));
        let mut stages = Stages::new();
        for plan in plans {
            let group_metrics = metrics.group(&plan.name).ok_or_else(|| {
                StructError::from(RuntimeReason::Bootstrap)
                    .with_detail(format!("no metrics registered for group {}", plan.name))
            })?;
            let ctx = SpawnCtx {
                config: &config,
                components: &components,
                normalizer: Arc::clone(&normalizer),
                metrics: group_metrics,
                cancel: &cancel,
            };
            spawn_group(plan, &ctx, &mut stages);
        }
        tb_info!(
            sys,
            groups = group_names.len(),
            readers = stages.readers.len(),
            shards = stages.shards.len(),
            sink = components.sink.name(),
            "engine started"
        );
        groups.push(stages.committers);
        groups.push(stages.shards);
        groups.push(stages.readers);

        op.mark_suc();
        Ok(Self {
            cancel,
            metrics_cancel,
            groups,
            components,
            metrics,
            metrics_addr,
        })
    }

    /// Address of the Prometheus endpoint, when metrics are enabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn metrics(&self) -> Arc<RuntimeMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Stop reading. In-flight events are still folded, finalized and
    /// committed before [`wait`](Self::wait) returns.
    pub fn shutdown(&self) {
        tb_info!(sys, "initiating graceful shutdown");
        self.cancel.cancel();
    }

    /// Join every task group in reverse start order. All groups are joined
    /// even if one fails; the first failure is returned.
    pub async fn wait(mut self) -> RuntimeResult<()> {
        let mut first_err = None;
        while let Some(group) = self.groups.pop() {
            let name = group.name;
            if name == "metrics" {
                self.metrics_cancel.cancel();
            }
            tb_debug!(sys, task_group = name, "waiting for task group to finish");
            if let Err(e) = group.wait().await {
                first_err.get_or_insert(e);
            }
            tb_debug!(sys, task_group = name, "task group finished");
        }

        close_sinks(&self.components).await;
        tb_info!(sys, summary = %self.metrics.summary_line(), "engine stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Root cancellation token, for wiring external shutdown triggers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

async fn close_sinks(components: &Components) {
    let sinks = std::iter::once(&components.sink).chain(components.dead_letter.as_ref());
    for sink in sinks {
        if let Err(e) = sink.close().await {
            tb_warn!(conn, sink = sink.name(), error = %e, "sink close failed");
        }
    }
}
