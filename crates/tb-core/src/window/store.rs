use std::collections::BTreeMap;

use crate::event::Event;
use crate::source::{Offset, PartitionId};

use super::key::WindowKey;
use super::state::WindowState;

// ---------------------------------------------------------------------------
// Phase / outcomes
// ---------------------------------------------------------------------------

/// Lifecycle of a window slot. Finalized windows are evicted outright and
/// have no slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting events.
    Open,
    /// Closed to new events; waiting for a successful sink write.
    Closing,
    /// Evicted by retention without a write. The tombstone keeps the window
    /// from being rebuilt out of its remaining events.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Folded,
    /// The window no longer accepts events.
    DroppedLate,
}

enum Slot {
    Open(WindowState),
    Closing(WindowState),
    Expired,
}

// ---------------------------------------------------------------------------
// WindowStore
// ---------------------------------------------------------------------------

/// Per-worker mapping from [`WindowKey`] to aggregate state.
///
/// Keys are kept ordered so sweeps visit windows deterministically.
pub struct WindowStore {
    slots: BTreeMap<WindowKey, Slot>,
    /// Event-time horizon in nanoseconds.
    retention: i64,
}

impl WindowStore {
    /// `retention` in nanoseconds of event time.
    pub fn new(retention: i64) -> Self {
        Self {
            slots: BTreeMap::new(),
            retention,
        }
    }

    pub fn phase(&self, key: &WindowKey) -> Option<Phase> {
        self.slots.get(key).map(|slot| match slot {
            Slot::Open(_) => Phase::Open,
            Slot::Closing(_) => Phase::Closing,
            Slot::Expired => Phase::Expired,
        })
    }

    /// Fold `event` into the window at `key`, creating it when unseen.
    pub fn fold(
        &mut self,
        key: WindowKey,
        partition: PartitionId,
        offset: Offset,
        event: &Event,
    ) -> FoldOutcome {
        let slot = self
            .slots
            .entry(key)
            .or_insert_with(|| Slot::Open(WindowState::default()));
        match slot {
            Slot::Open(state) => {
                state.fold(partition, offset, event);
                FoldOutcome::Folded
            }
            Slot::Closing(_) | Slot::Expired => FoldOutcome::DroppedLate,
        }
    }

    /// Move every open window the watermark has passed to `Closing`.
    /// Returns how many windows changed phase.
    pub fn begin_close(&mut self, watermark: Option<i64>) -> usize {
        let Some(wm) = watermark else {
            return 0;
        };
        let mut closed = 0;
        for (key, slot) in self.slots.iter_mut() {
            if wm <= key.window_end {
                continue;
            }
            if let Slot::Open(state) = slot {
                *slot = Slot::Closing(std::mem::take(state));
                closed += 1;
            }
        }
        closed
    }

    /// Evict open windows whose end trails `leading` (the highest event time
    /// seen on any partition) by more than the retention horizon. Their
    /// state is discarded without a write and a tombstone stays until the
    /// watermark passes `window_end`.
    pub fn expire(&mut self, leading: Option<i64>) -> Vec<(WindowKey, WindowState)> {
        let Some(leading) = leading else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        for (key, slot) in self.slots.iter_mut() {
            if leading <= key.window_end.saturating_add(self.retention) {
                continue;
            }
            if let Slot::Open(state) = slot {
                expired.push((*key, std::mem::take(state)));
                *slot = Slot::Expired;
            }
        }
        expired
    }

    /// Keys currently in `Closing`, in key order.
    pub fn closing_keys(&self) -> Vec<WindowKey> {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Closing(_)))
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn closing(&self, key: &WindowKey) -> Option<&WindowState> {
        match self.slots.get(key) {
            Some(Slot::Closing(state)) => Some(state),
            _ => None,
        }
    }

    /// Evict a `Closing` window, returning its final state.
    pub fn finalize(&mut self, key: &WindowKey) -> Option<WindowState> {
        if !matches!(self.slots.get(key), Some(Slot::Closing(_))) {
            return None;
        }
        match self.slots.remove(key) {
            Some(Slot::Closing(state)) => Some(state),
            _ => None,
        }
    }

    /// Drop tombstones the watermark has passed; the late check rejects
    /// their events from then on.
    pub fn purge_tombstones(&mut self, watermark: Option<i64>) -> usize {
        let Some(wm) = watermark else {
            return 0;
        };
        let before = self.slots.len();
        self.slots
            .retain(|key, slot| !(matches!(slot, Slot::Expired) && wm > key.window_end));
        before - self.slots.len()
    }

    /// Smallest offset per partition still referenced by an unfinalized
    /// window.
    pub fn unfinalized_first_offsets(&self) -> BTreeMap<PartitionId, Offset> {
        let mut firsts: BTreeMap<PartitionId, Offset> = BTreeMap::new();
        for slot in self.slots.values() {
            let state = match slot {
                Slot::Open(state) | Slot::Closing(state) => state,
                Slot::Expired => continue,
            };
            for (partition, span) in &state.spans {
                firsts
                    .entry(*partition)
                    .and_modify(|o| *o = (*o).min(span.first))
                    .or_insert(span.first);
            }
        }
        firsts
    }

    pub fn open_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Open(_)))
            .count()
    }

    pub fn closing_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Closing(_)))
            .count()
    }

    /// Total slots, tombstones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1_000_000_000;

    fn key(start_sec: i64) -> WindowKey {
        WindowKey {
            group_key: 1,
            window_start: start_sec * SEC,
            window_end: (start_sec + 60) * SEC,
        }
    }

    fn event(value: f64, tag: &str) -> Event {
        Event {
            group_key: 1,
            user_id: "1".into(),
            event_type: "t".into(),
            event_time: 0,
            value,
            payload: String::new(),
            tag: tag.into(),
        }
    }

    // -- 1. fold and first-seen tag ---

    #[test]
    fn fold_accumulates() {
        let mut store = WindowStore::new(600 * SEC);
        store.fold(key(0), 0, 5, &event(1.0, "a"));
        store.fold(key(0), 1, 2, &event(2.5, "b"));
        store.fold(key(0), 0, 9, &event(0.5, "c"));

        assert_eq!(store.begin_close(Some(61 * SEC)), 1);
        let state = store.closing(&key(0)).unwrap();
        assert_eq!(state.count, 3);
        assert_eq!(state.sum, 4.0);
        assert_eq!(state.sample_tag, "a");
        assert_eq!(state.spans[&0].first, 5);
        assert_eq!(state.spans[&0].last, 9);
        assert_eq!(state.spans[&1].first, 2);
    }

    // -- 2. closing windows reject events ---

    #[test]
    fn closing_rejects_and_finalize_evicts() {
        let mut store = WindowStore::new(600 * SEC);
        store.fold(key(0), 0, 0, &event(1.0, "a"));
        assert_eq!(store.begin_close(Some(60 * SEC)), 0, "wm must exceed end");
        assert_eq!(store.begin_close(Some(60 * SEC + 1)), 1);
        assert_eq!(
            store.fold(key(0), 0, 1, &event(1.0, "b")),
            FoldOutcome::DroppedLate
        );
        let state = store.finalize(&key(0)).unwrap();
        assert_eq!(state.count, 1);
        assert!(store.is_empty());
    }

    // -- 3. retention expires without closing ---

    #[test]
    fn retention_expires_and_tombstones() {
        let mut store = WindowStore::new(10 * SEC);
        store.fold(key(0), 0, 0, &event(1.0, "a"));
        store.fold(key(60), 0, 1, &event(1.0, "b"));

        // [0,60) ends 60s; the horizon is passed only beyond 70s.
        assert!(store.expire(Some(70 * SEC)).is_empty());
        let expired = store.expire(Some(71 * SEC));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, key(0));
        assert_eq!(expired[0].1.count, 1);

        assert_eq!(store.phase(&key(0)), Some(Phase::Expired));
        assert_eq!(store.phase(&key(60)), Some(Phase::Open));
        assert!(store.closing_keys().is_empty(), "nothing to write");
        assert_eq!(
            store.fold(key(0), 0, 2, &event(1.0, "c")),
            FoldOutcome::DroppedLate
        );
        assert_eq!(store.begin_close(Some(61 * SEC)), 0, "tombstones never close");
        assert_eq!(store.unfinalized_first_offsets()[&0], 1);

        assert_eq!(store.purge_tombstones(Some(60 * SEC)), 0);
        assert_eq!(store.purge_tombstones(Some(61 * SEC)), 1);
        assert_eq!(store.len(), 1);
    }

    // -- 4. unfinalized offsets ---

    #[test]
    fn first_offsets_cover_open_and_closing() {
        let mut store = WindowStore::new(600 * SEC);
        store.fold(key(0), 0, 3, &event(1.0, "a"));
        store.fold(key(60), 0, 7, &event(1.0, "b"));
        store.fold(key(60), 2, 1, &event(1.0, "c"));
        store.begin_close(Some(61 * SEC));

        let firsts = store.unfinalized_first_offsets();
        assert_eq!(firsts[&0], 3);
        assert_eq!(firsts[&2], 1);

        store.finalize(&key(0));
        assert_eq!(store.unfinalized_first_offsets()[&0], 7);
        assert_eq!(store.open_count(), 1);
        assert_eq!(store.closing_count(), 0);
    }
}
