//! Single-owner shard state: folds events, follows progress markers and
//! reports commit-safe offsets.

use std::collections::{BTreeMap, BTreeSet};

use tb_config::WindowConfig;

use crate::event::Event;
use crate::source::{Offset, PartitionId};
use crate::window::{
    FoldOutcome, OffsetSpan, TumblingAssigner, WatermarkTracker, WindowKey, WindowState, WindowStore,
};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Reader progress for one partition, sent after each batch behind that
/// batch's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub partition: PartitionId,
    /// Every offset below this has been delivered.
    pub next_offset: Offset,
    /// Running maximum event time over all well-formed records read so far.
    pub max_event_time: Option<i64>,
    pub idle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Folded,
    DroppedLate,
    /// Already finalized before the last commit; replayed after a restart.
    SkippedReplay,
}

/// A window that left the store, written or expired, with the offsets that
/// fed it. Replay after a restart skips it either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedWindow {
    pub key: WindowKey,
    pub spans: BTreeMap<PartitionId, OffsetSpan>,
}

/// What a shard tells the commit coordinator after a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardReport {
    pub shard: usize,
    /// Per partition, the offset below which this shard holds nothing
    /// unfinalized.
    pub safe: BTreeMap<PartitionId, Offset>,
    pub finalized: Vec<FinalizedWindow>,
    pub open_windows: usize,
}

// ---------------------------------------------------------------------------
// WindowWorker
// ---------------------------------------------------------------------------

pub struct WindowWorker {
    shard: usize,
    assigner: TumblingAssigner,
    allowed_lateness: i64,
    store: WindowStore,
    tracker: WatermarkTracker,
    next_offsets: BTreeMap<PartitionId, Offset>,
    replay_skip: BTreeMap<PartitionId, BTreeSet<WindowKey>>,
    finalized: Vec<FinalizedWindow>,
}

impl WindowWorker {
    pub fn new(shard: usize, config: &WindowConfig) -> Self {
        Self {
            shard,
            assigner: TumblingAssigner::new(config.duration.as_nanos_i64()),
            allowed_lateness: config.allowed_lateness.as_nanos_i64(),
            store: WindowStore::new(config.retention.as_nanos_i64()),
            tracker: WatermarkTracker::new(config.watermark_delay.as_nanos_i64()),
            next_offsets: BTreeMap::new(),
            replay_skip: BTreeMap::new(),
            finalized: Vec::new(),
        }
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Declare a partition this worker will receive, optionally resuming from
    /// a checkpoint: `next_offset` and `max_event_time` as committed, plus
    /// the windows already finalized that replay must not touch.
    pub fn register_partition(
        &mut self,
        partition: PartitionId,
        next_offset: Offset,
        max_event_time: Option<i64>,
        skip: BTreeSet<WindowKey>,
    ) {
        self.tracker.register(partition);
        if max_event_time.is_some() {
            self.tracker.observe(partition, max_event_time, false);
        }
        self.next_offsets.insert(partition, next_offset);
        if !skip.is_empty() {
            self.replay_skip.insert(partition, skip);
        }
    }

    /// Apply one event. Lateness is judged against the watermark as it
    /// stood before this event's batch.
    pub fn on_event(
        &mut self,
        partition: PartitionId,
        offset: Offset,
        event: &Event,
    ) -> Admit {
        let key = self.assigner.assign(event.group_key, event.event_time);

        if self
            .replay_skip
            .get(&partition)
            .is_some_and(|skip| skip.contains(&key))
        {
            return Admit::SkippedReplay;
        }

        let late = self.tracker.watermark().is_some_and(|wm| {
            event.event_time < wm.saturating_sub(self.allowed_lateness) || wm > key.window_end
        });
        if late {
            return Admit::DroppedLate;
        }

        match self.store.fold(key, partition, offset, event) {
            FoldOutcome::Folded => Admit::Folded,
            FoldOutcome::DroppedLate => Admit::DroppedLate,
        }
    }

    /// Apply a progress marker. Returns `true` when the combined watermark
    /// advanced.
    pub fn on_progress(&mut self, progress: &Progress) -> bool {
        let next = self.next_offsets.entry(progress.partition).or_insert(0);
        *next = (*next).max(progress.next_offset);
        self.tracker
            .observe(progress.partition, progress.max_event_time, progress.idle)
    }

    pub fn watermark(&self) -> Option<i64> {
        self.tracker.watermark()
    }

    /// Transition windows the watermark has passed to `Closing`.
    pub fn begin_close(&mut self) -> usize {
        self.store.begin_close(self.tracker.watermark())
    }

    /// Evict open windows left behind the retention horizon without writing
    /// them, and queue them for the next report.
    pub fn expire_stale(&mut self) -> Vec<(WindowKey, WindowState)> {
        let expired = self.store.expire(self.tracker.leading_event_time());
        for (key, state) in &expired {
            self.finalized.push(FinalizedWindow {
                key: *key,
                spans: state.spans.clone(),
            });
        }
        expired
    }

    pub fn closing_keys(&self) -> Vec<WindowKey> {
        self.store.closing_keys()
    }

    pub fn closing(&self, key: &WindowKey) -> Option<&WindowState> {
        self.store.closing(key)
    }

    /// Evict a closing window and queue it for the next report.
    pub fn complete(&mut self, key: &WindowKey) -> Option<WindowState> {
        let state = self.store.finalize(key)?;
        self.finalized.push(FinalizedWindow {
            key: *key,
            spans: state.spans.clone(),
        });
        Some(state)
    }

    pub fn purge_tombstones(&mut self) -> usize {
        self.store.purge_tombstones(self.tracker.watermark())
    }

    pub fn open_windows(&self) -> usize {
        self.store.open_count()
    }

    pub fn closing_windows(&self) -> usize {
        self.store.closing_count()
    }

    pub fn safe_offsets(&self) -> BTreeMap<PartitionId, Offset> {
        let firsts = self.store.unfinalized_first_offsets();
        self.next_offsets
            .iter()
            .map(|(p, next)| {
                let safe = firsts.get(p).map_or(*next, |first| (*first).min(*next));
                (*p, safe)
            })
            .collect()
    }

    /// Drain finalized windows recorded since the previous report.
    pub fn take_report(&mut self) -> ShardReport {
        ShardReport {
            shard: self.shard,
            safe: self.safe_offsets(),
            finalized: std::mem::take(&mut self.finalized),
            open_windows: self.store.open_count() + self.store.closing_count(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tb_config::HumanDuration;

    const SEC: i64 = 1_000_000_000;

    fn test_config(lateness_secs: u64) -> WindowConfig {
        WindowConfig {
            duration: HumanDuration::from_secs(60),
            allowed_lateness: HumanDuration::from_secs(lateness_secs),
            watermark_delay: HumanDuration::from_secs(lateness_secs),
            count_ceiling: 1000,
            retention: HumanDuration::from_secs(600),
        }
    }

    fn ev(user: i64, secs: i64, value: f64) -> Event {
        Event {
            group_key: user,
            user_id: user.to_string(),
            event_type: "t".into(),
            event_time: secs * SEC,
            value,
            payload: String::new(),
            tag: format!("{user}_{secs}"),
        }
    }

    fn progress(partition: PartitionId, next: Offset, max_secs: i64) -> Progress {
        Progress {
            partition,
            next_offset: next,
            max_event_time: Some(max_secs * SEC),
            idle: false,
        }
    }

    // -- 1. lateness ---

    #[test]
    fn drops_events_behind_watermark() {
        let mut w = WindowWorker::new(0, &test_config(5));
        w.register_partition(0, 0, None, BTreeSet::new());
        assert_eq!(w.on_event(0, 0, &ev(1, 10, 1.0)), Admit::Folded);
        w.on_progress(&progress(0, 1, 100));
        assert_eq!(w.watermark(), Some(95 * SEC));

        // 89s < 95s - 5s
        assert_eq!(w.on_event(0, 1, &ev(1, 89, 1.0)), Admit::DroppedLate);
        // 92s is within lateness but its window [60,120) is still open.
        assert_eq!(w.on_event(0, 2, &ev(1, 92, 1.0)), Admit::Folded);
        // 59s belongs to [0,60), which the watermark already passed.
        w.on_progress(&progress(0, 3, 100));
        assert_eq!(w.on_event(0, 3, &ev(2, 59, 1.0)), Admit::DroppedLate);
    }

    // -- 2. safe offsets ---

    #[test]
    fn safe_offsets_hold_unfinalized_windows() {
        let mut w = WindowWorker::new(0, &test_config(0));
        w.register_partition(0, 0, None, BTreeSet::new());
        w.register_partition(1, 0, None, BTreeSet::new());

        w.on_event(0, 0, &ev(1, 10, 1.0));
        w.on_event(1, 4, &ev(1, 70, 1.0));
        w.on_progress(&progress(0, 2, 61));
        w.on_progress(&progress(1, 5, 70));

        let safe = w.safe_offsets();
        assert_eq!(safe[&0], 0);
        assert_eq!(safe[&1], 4);

        assert_eq!(w.begin_close(), 1);
        let key = w.closing_keys()[0];
        w.complete(&key).unwrap();

        let report = w.take_report();
        assert_eq!(report.safe[&0], 2);
        assert_eq!(report.safe[&1], 4);
        assert_eq!(report.finalized.len(), 1);
        assert_eq!(report.finalized[0].spans[&0].last, 0);
        assert!(w.take_report().finalized.is_empty());
    }

    // -- 3. replay skip ---

    #[test]
    fn replayed_finalized_window_is_skipped() {
        let cfg = test_config(0);
        let key = TumblingAssigner::new(cfg.duration.as_nanos_i64()).assign(1, 10 * SEC);
        let mut w = WindowWorker::new(0, &cfg);
        w.register_partition(0, 3, Some(10 * SEC), BTreeSet::from([key]));

        assert_eq!(w.on_event(0, 3, &ev(1, 10, 1.0)), Admit::SkippedReplay);
        assert_eq!(w.on_event(0, 4, &ev(2, 10, 1.0)), Admit::Folded);
        assert_eq!(w.safe_offsets()[&0], 3);
    }
}
