use serde::{Deserialize, Serialize};

/// Identifies one aggregate: a group key and its tumbling window
/// `[window_start, window_end)`, both in epoch nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub group_key: i64,
    pub window_start: i64,
    pub window_end: i64,
}

/// Assigns event times to fixed, contiguous, non-overlapping windows.
#[derive(Debug, Clone, Copy)]
pub struct TumblingAssigner {
    duration: i64,
}

impl TumblingAssigner {
    /// `duration` is in nanoseconds and must be positive.
    pub fn new(duration: i64) -> Self {
        Self {
            duration: duration.max(1),
        }
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    /// `window_start = floor(event_time / duration) * duration`. Floor
    /// division keeps pre-epoch times in the window that contains them.
    pub fn assign(&self, group_key: i64, event_time: i64) -> WindowKey {
        let window_start = event_time.div_euclid(self.duration) * self.duration;
        WindowKey {
            group_key,
            window_start,
            window_end: window_start.saturating_add(self.duration),
        }
    }
}
