use std::collections::BTreeMap;

use crate::source::PartitionId;

#[derive(Debug, Clone, Copy, Default)]
struct PartitionMark {
    max_event_time: Option<i64>,
    idle: bool,
}

/// Tracks event-time progress per source partition and derives the
/// combined watermark used for closing windows.
///
/// A partition's watermark is `max_event_time - delay`. The combined
/// watermark is the minimum over active (non-idle) partitions and never
/// moves backwards. A registered partition that has not reported an event
/// time yet holds the combined watermark back.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    delay: i64,
    partitions: BTreeMap<PartitionId, PartitionMark>,
    combined: Option<i64>,
}

impl WatermarkTracker {
    /// `delay` in nanoseconds.
    pub fn new(delay: i64) -> Self {
        Self {
            delay,
            partitions: BTreeMap::new(),
            combined: None,
        }
    }

    pub fn register(&mut self, partition: PartitionId) {
        self.partitions.entry(partition).or_default();
    }

    /// Record progress for `partition`. Returns `true` when the combined
    /// watermark advanced.
    pub fn observe(
        &mut self,
        partition: PartitionId,
        max_event_time: Option<i64>,
        idle: bool,
    ) -> bool {
        let mark = self.partitions.entry(partition).or_default();
        mark.max_event_time = match (mark.max_event_time, max_event_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        mark.idle = idle;
        self.recompute()
    }

    pub fn partition_watermark(&self, partition: PartitionId) -> Option<i64> {
        self.partitions
            .get(&partition)
            .and_then(|m| m.max_event_time)
            .map(|t| t.saturating_sub(self.delay))
    }

    /// Combined watermark, `None` until every active partition has reported.
    pub fn watermark(&self) -> Option<i64> {
        self.combined
    }

    /// Highest event time reported by any partition, idle ones included.
    pub fn leading_event_time(&self) -> Option<i64> {
        self.partitions.values().filter_map(|m| m.max_event_time).max()
    }

    pub fn is_idle(&self, partition: PartitionId) -> bool {
        self.partitions.get(&partition).is_some_and(|m| m.idle)
    }

    fn recompute(&mut self) -> bool {
        let mut candidate: Option<i64> = None;
        let mut any_active = false;
        for mark in self.partitions.values().filter(|m| !m.idle) {
            any_active = true;
            let Some(max) = mark.max_event_time else {
                return false;
            };
            let wm = max.saturating_sub(self.delay);
            candidate = Some(candidate.map_or(wm, |c| c.min(wm)));
        }
        if !any_active {
            return false;
        }
        match (candidate, self.combined) {
            (Some(c), Some(cur)) if c > cur => {
                self.combined = Some(c);
                true
            }
            (Some(c), None) => {
                self.combined = Some(c);
                true
            }
            _ => false,
        }
    }
}
