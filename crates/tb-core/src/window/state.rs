use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::source::{Offset, PartitionId};

/// First and last source offsets folded into a window from one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetSpan {
    pub first: Offset,
    pub last: Offset,
}

/// Incremental aggregate of one window. Owned by exactly one worker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowState {
    pub count: u64,
    pub sum: f64,
    /// Tag of the first event folded in processing order.
    pub sample_tag: String,
    pub spans: BTreeMap<PartitionId, OffsetSpan>,
}

impl WindowState {
    pub fn fold(&mut self, partition: PartitionId, offset: Offset, event: &Event) {
        if self.count == 0 {
            self.sample_tag.clone_from(&event.tag);
        }
        self.count += 1;
        self.sum += event.value;
        self.spans
            .entry(partition)
            .and_modify(|span| {
                span.first = span.first.min(offset);
                span.last = span.last.max(offset);
            })
            .or_insert(OffsetSpan {
                first: offset,
                last: offset,
            });
    }
}
