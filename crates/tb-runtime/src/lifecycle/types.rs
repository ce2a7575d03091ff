use std::collections::BTreeSet;

use tokio::task::JoinHandle;

use orion_error::compat_prelude::*;
use orion_error::prelude::*;
use tb_core::commit::CommitLedger;
use tb_core::window::WindowKey;
use tb_core::worker::WindowWorker;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::reader_task::PartitionSlot;

// ---------------------------------------------------------------------------
// TaskGroup
// ---------------------------------------------------------------------------

/// Tasks that stop together.
///
/// Groups start downstream-first and are joined in reverse:
///
///   start:  metrics → committers → shards → readers
///   join:   readers → shards → committers → metrics
///
/// Each stage exits once its upstream senders are gone, so joining in this
/// order drains every channel before the commit coordinator's final save.
pub(crate) struct TaskGroup {
    pub(super) name: &'static str,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl TaskGroup {
    pub(super) fn new(name: &'static str) -> Self {
        Self {
            name,
            handles: Vec::new(),
        }
    }

    pub(super) fn push(&mut self, handle: JoinHandle<anyhow::Result<()>>) {
        self.handles.push(handle);
    }

    pub(super) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Join every task, returning the first failure after all have ended.
    pub(super) async fn wait(self) -> RuntimeResult<()> {
        let mut first = None;
        for handle in self.handles {
            let outcome = match handle.await {
                Ok(result) => result.owe(RuntimeReason::Shutdown),
                Err(e) => Err(StructError::from(RuntimeReason::Shutdown)
                    .with_detail(format!("task join error: {e}"))),
            };
            if let Err(e) = outcome {
                tb_error!(sys, task_group = self.name, error = %e, "task failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// Bootstrap plans
// ---------------------------------------------------------------------------

/// Resume point of one partition.
#[derive(Debug, Clone, Default)]
pub(super) struct PartitionResume {
    pub next_offset: i64,
    pub max_event_time: Option<i64>,
    pub skip: BTreeSet<WindowKey>,
}

/// Everything one consumer group needs before its tasks are spawned.
pub(super) struct GroupPlan {
    pub name: String,
    pub ledger: CommitLedger,
    pub workers: Vec<WindowWorker>,
    /// Partition slots per reader task.
    pub readers: Vec<Vec<PartitionSlot>>,
}
