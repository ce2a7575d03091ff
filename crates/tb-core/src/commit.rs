//! Offset commit bookkeeping: checkpoints, the offset store seam and the
//! ledger that decides how far each partition may advance.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::source::{Offset, PartitionId};
use crate::window::WindowKey;
use crate::worker::{Progress, ShardReport};

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// A finalized window still reachable by replay from the committed offset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FinalizedId {
    pub window: WindowKey,
    /// Last offset of this partition folded into the window.
    pub last_offset: Offset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub partition: PartitionId,
    /// Next offset to read.
    pub offset: Offset,
    /// Running maximum event time of the partition at `offset`.
    pub max_event_time: Option<i64>,
    pub finalized_window_ids: BTreeSet<FinalizedId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub consumer_group: String,
    pub records: BTreeMap<PartitionId, CommitRecord>,
}

impl Checkpoint {
    pub fn new(consumer_group: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            records: BTreeMap::new(),
        }
    }

    pub fn offset(&self, partition: PartitionId) -> Option<Offset> {
        self.records.get(&partition).map(|r| r.offset)
    }

    /// Windows whose replayed events from `partition` must be skipped.
    pub fn skip_set(&self, partition: PartitionId) -> BTreeSet<WindowKey> {
        self.records
            .get(&partition)
            .map(|r| r.finalized_window_ids.iter().map(|f| f.window).collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// OffsetStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    #[error("offset store unavailable: {0}")]
    Unavailable(String),
    #[error("checkpoint is corrupt: {0}")]
    Corrupt(String),
}

/// Durable home of committed checkpoints, one per consumer group.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn load(&self, consumer_group: &str) -> Result<Option<Checkpoint>, CommitError>;

    /// Replace the group's checkpoint atomically.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CommitError>;
}

#[derive(Default)]
pub struct MemoryOffsetStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    unavailable: RwLock<bool>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `save` fail until reset.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self, consumer_group: &str) -> Result<Option<Checkpoint>, CommitError> {
        Ok(self.checkpoints.read().await.get(consumer_group).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CommitError> {
        if *self.unavailable.read().await {
            return Err(CommitError::Unavailable("memory store offline".into()));
        }
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.consumer_group.clone(), checkpoint.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommitLedger
// ---------------------------------------------------------------------------

/// Decides, per partition, the highest offset that is safe to commit.
///
/// An offset is committable when every shard reports nothing unfinalized
/// below it and it sits on a reader progress boundary, whose running max
/// event time is then persisted alongside it. Offsets only ever advance, and
/// only after the store confirms the save. A window finalized since the last
/// save also warrants a new checkpoint, so the skip set reaches the store even
/// while an open window pins the offset.
pub struct CommitLedger {
    consumer_group: String,
    safe: Vec<BTreeMap<PartitionId, Offset>>,
    boundaries: BTreeMap<PartitionId, BTreeMap<Offset, Option<i64>>>,
    committed: BTreeMap<PartitionId, (Offset, Option<i64>)>,
    finalized: BTreeMap<PartitionId, BTreeMap<WindowKey, Offset>>,
    unsaved: bool,
}

impl CommitLedger {
    pub fn new(consumer_group: impl Into<String>, shards: usize) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            safe: vec![BTreeMap::new(); shards.max(1)],
            boundaries: BTreeMap::new(),
            committed: BTreeMap::new(),
            finalized: BTreeMap::new(),
            unsaved: false,
        }
    }

    /// Start from a previously saved checkpoint.
    pub fn resume(shards: usize, checkpoint: &Checkpoint) -> Self {
        let mut ledger = Self::new(checkpoint.consumer_group.clone(), shards);
        for (p, record) in &checkpoint.records {
            ledger
                .committed
                .insert(*p, (record.offset, record.max_event_time));
            ledger
                .boundaries
                .entry(*p)
                .or_default()
                .insert(record.offset, record.max_event_time);
            let finalized = ledger.finalized.entry(*p).or_default();
            for id in &record.finalized_window_ids {
                finalized.insert(id.window, id.last_offset);
            }
        }
        ledger
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn committed_offset(&self, partition: PartitionId) -> Option<Offset> {
        self.committed.get(&partition).map(|(o, _)| *o)
    }

    pub fn observe_progress(&mut self, progress: &Progress) {
        let floor = self.committed_offset(progress.partition);
        if floor.is_some_and(|c| progress.next_offset < c) {
            return;
        }
        self.boundaries
            .entry(progress.partition)
            .or_default()
            .insert(progress.next_offset, progress.max_event_time);
    }

    pub fn apply_report(&mut self, report: ShardReport) {
        if let Some(slot) = self.safe.get_mut(report.shard) {
            *slot = report.safe;
        }
        for window in report.finalized {
            for (p, span) in window.spans {
                if self.committed_offset(p).is_some_and(|c| span.last < c) {
                    continue;
                }
                let previous = self
                    .finalized
                    .entry(p)
                    .or_default()
                    .insert(window.key, span.last);
                if previous != Some(span.last) {
                    self.unsaved = true;
                }
            }
        }
    }

    fn min_safe(&self, partition: PartitionId) -> Option<Offset> {
        self.safe
            .iter()
            .map(|shard| shard.get(&partition).copied())
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .min()
    }

    /// Build the next checkpoint, or `None` when no partition can advance
    /// and no finalized window awaits saving.
    pub fn prepare(&self) -> Option<Checkpoint> {
        let mut advanced = self.unsaved;
        let mut checkpoint = Checkpoint::new(self.consumer_group.clone());

        for (p, bounds) in &self.boundaries {
            let current = self.committed.get(p).copied();
            let target = self
                .min_safe(*p)
                .and_then(|safe| bounds.range(..=safe).next_back())
                .map(|(o, m)| (*o, *m));
            let chosen = match (current, target) {
                (Some(cur), Some(t)) if t.0 > cur.0 => {
                    advanced = true;
                    t
                }
                (None, Some(t)) => {
                    advanced = true;
                    t
                }
                (Some(cur), _) => cur,
                (None, None) => continue,
            };

            let finalized_window_ids = self
                .finalized
                .get(p)
                .map(|windows| {
                    windows
                        .iter()
                        .filter(|(_, last)| **last >= chosen.0)
                        .map(|(window, last)| FinalizedId {
                            window: *window,
                            last_offset: *last,
                        })
                        .collect()
                })
                .unwrap_or_default();

            checkpoint.records.insert(
                *p,
                CommitRecord {
                    partition: *p,
                    offset: chosen.0,
                    max_event_time: chosen.1,
                    finalized_window_ids,
                },
            );
        }

        (advanced && !checkpoint.records.is_empty()).then_some(checkpoint)
    }

    /// Adopt a checkpoint the store has durably saved.
    pub fn confirm(&mut self, checkpoint: &Checkpoint) {
        for (p, record) in &checkpoint.records {
            self.committed
                .insert(*p, (record.offset, record.max_event_time));
            if let Some(bounds) = self.boundaries.get_mut(p) {
                bounds.retain(|o, _| *o >= record.offset);
            }
            if let Some(windows) = self.finalized.get_mut(p) {
                windows.retain(|_, last| *last >= record.offset);
            }
        }
        self.unsaved = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::OffsetSpan;
    use crate::worker::FinalizedWindow;

    fn key(user: i64) -> WindowKey {
        WindowKey {
            group_key: user,
            window_start: 0,
            window_end: 60,
        }
    }

    fn progress(p: PartitionId, next: Offset, max: i64) -> Progress {
        Progress {
            partition: p,
            next_offset: next,
            max_event_time: Some(max),
            idle: false,
        }
    }

    fn report(shard: usize, safe: &[(PartitionId, Offset)]) -> ShardReport {
        ShardReport {
            shard,
            safe: safe.iter().copied().collect(),
            finalized: Vec::new(),
            open_windows: 0,
        }
    }

    // -- 1. min over shards ---

    #[test]
    fn commits_minimum_safe_boundary() {
        let mut ledger = CommitLedger::new("g", 2);
        ledger.observe_progress(&progress(0, 0, 0));
        ledger.observe_progress(&progress(0, 6, 50));
        ledger.observe_progress(&progress(0, 12, 90));

        ledger.apply_report(report(0, &[(0, 12)]));
        assert!(ledger.prepare().is_none(), "shard 1 has not reported");

        ledger.apply_report(report(1, &[(0, 9)]));
        let cp = ledger.prepare().unwrap();
        let rec = &cp.records[&0];
        assert_eq!(rec.offset, 6, "rounded down to a progress boundary");
        assert_eq!(rec.max_event_time, Some(50));

        ledger.confirm(&cp);
        assert_eq!(ledger.committed_offset(0), Some(6));
        assert!(ledger.prepare().is_none(), "nothing new to commit");
    }

    // -- 2. never regresses ---

    #[test]
    fn offsets_never_move_backwards() {
        let mut ledger = CommitLedger::new("g", 1);
        ledger.observe_progress(&progress(0, 10, 1));
        ledger.apply_report(report(0, &[(0, 10)]));
        let cp = ledger.prepare().unwrap();
        ledger.confirm(&cp);

        ledger.observe_progress(&progress(0, 4, 1));
        ledger.apply_report(report(0, &[(0, 4)]));
        assert!(ledger.prepare().is_none());
        assert_eq!(ledger.committed_offset(0), Some(10));
    }

    // -- 3. finalized ids kept while reachable ---

    #[test]
    fn finalized_ids_pruned_once_behind_commit() {
        let mut ledger = CommitLedger::new("g", 1);
        ledger.observe_progress(&progress(0, 0, 0));
        ledger.observe_progress(&progress(0, 5, 10));
        ledger.observe_progress(&progress(0, 10, 20));

        let mut r = report(0, &[(0, 5)]);
        r.finalized = vec![
            FinalizedWindow {
                key: key(1),
                spans: BTreeMap::from([(0, OffsetSpan { first: 0, last: 3 })]),
            },
            FinalizedWindow {
                key: key(2),
                spans: BTreeMap::from([(0, OffsetSpan { first: 2, last: 7 })]),
            },
        ];
        ledger.apply_report(r);

        let cp = ledger.prepare().unwrap();
        ledger.confirm(&cp);
        let ids = &cp.records[&0].finalized_window_ids;
        assert_eq!(ids.len(), 1);
        assert_eq!(cp.skip_set(0), BTreeSet::from([key(2)]));

        ledger.apply_report(report(0, &[(0, 10)]));
        let cp = ledger.prepare().unwrap();
        assert_eq!(cp.offset(0), Some(10));
        assert!(cp.records[&0].finalized_window_ids.is_empty());
    }

    #[test]
    fn pinned_offset_still_saves_new_finalized_window() {
        let mut ledger = CommitLedger::new("g", 1);
        ledger.observe_progress(&progress(0, 0, 0));
        ledger.observe_progress(&progress(0, 3, 100));

        ledger.apply_report(report(0, &[(0, 0)]));
        let cp = ledger.prepare().unwrap();
        ledger.confirm(&cp);
        assert!(cp.skip_set(0).is_empty());
        assert!(ledger.prepare().is_none());

        let mut r = report(0, &[(0, 0)]);
        r.finalized = vec![FinalizedWindow {
            key: key(42),
            spans: BTreeMap::from([(0, OffsetSpan { first: 1, last: 1 })]),
        }];
        ledger.apply_report(r);
        let cp = ledger.prepare().expect("finalized window must be saved");
        assert_eq!(cp.offset(0), Some(0));
        assert_eq!(cp.skip_set(0), BTreeSet::from([key(42)]));

        ledger.confirm(&cp);
        ledger.apply_report(report(0, &[(0, 0)]));
        assert!(ledger.prepare().is_none(), "already saved");
    }

    // -- 4. resume ---

    #[test]
    fn resume_keeps_committed_state() {
        let mut cp = Checkpoint::new("g");
        cp.records.insert(
            0,
            CommitRecord {
                partition: 0,
                offset: 8,
                max_event_time: Some(42),
                finalized_window_ids: BTreeSet::from([FinalizedId {
                    window: key(1),
                    last_offset: 9,
                }]),
            },
        );
        let mut ledger = CommitLedger::resume(1, &cp);
        assert_eq!(ledger.committed_offset(0), Some(8));

        ledger.observe_progress(&progress(0, 12, 60));
        ledger.apply_report(report(0, &[(0, 12)]));
        let next = ledger.prepare().unwrap();
        assert_eq!(next.offset(0), Some(12));
        assert!(next.skip_set(0).is_empty());
    }

    // -- 5. memory store ---

    #[tokio::test]
    async fn memory_store_round_trip_and_outage() {
        let store = MemoryOffsetStore::new();
        assert!(store.load("g").await.unwrap().is_none());

        let cp = Checkpoint::new("g");
        store.save(&cp).await.unwrap();
        assert_eq!(store.load("g").await.unwrap(), Some(cp.clone()));

        store.set_unavailable(true).await;
        assert!(matches!(
            store.save(&cp).await,
            Err(CommitError::Unavailable(_))
        ));
    }

    #[test]
    fn checkpoint_json_uses_string_partition_keys() {
        let mut cp = Checkpoint::new("g");
        cp.records.insert(
            3,
            CommitRecord {
                partition: 3,
                offset: 1,
                max_event_time: None,
                finalized_window_ids: BTreeSet::new(),
            },
        );
        let json = serde_json::to_string(&cp).unwrap();
        assert!(json.contains("\"3\":"), "{json}");
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cp);
    }
}
