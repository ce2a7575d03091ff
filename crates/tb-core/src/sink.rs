use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::window::{WindowKey, WindowState};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Connection loss, timeouts, full disks: worth retrying.
    #[error("transient sink failure: {0}")]
    Transient(String),
    /// The sink will never accept this row.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Upsert key of the shared result table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub window_start: DateTime<Utc>,
    pub group_key: i64,
    pub consumer_group: String,
}

/// One finalized window as written to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRow {
    pub consumer_group: String,
    pub user_id: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub count: u64,
    pub total_value: f64,
    pub event_hash: String,
}

impl WindowRow {
    pub fn from_window(key: &WindowKey, state: &WindowState, consumer_group: &str) -> Self {
        Self {
            consumer_group: consumer_group.to_string(),
            user_id: key.group_key,
            window_start: DateTime::from_timestamp_nanos(key.window_start),
            window_end: DateTime::from_timestamp_nanos(key.window_end),
            count: state.count,
            total_value: state.sum,
            event_hash: state.sample_tag.clone(),
        }
    }

    pub fn key(&self) -> RowKey {
        RowKey {
            window_start: self.window_start,
            group_key: self.user_id,
            consumer_group: self.consumer_group.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// WindowSink
// ---------------------------------------------------------------------------

/// Upsert-capable destination for finalized windows.
///
/// `upsert` must be idempotent: writing the same row twice leaves the same
/// table. A successful return means the row is durable.
#[async_trait]
pub trait WindowSink: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert(&self, row: &WindowRow) -> Result<(), SinkError>;

    /// Release resources. Called once after every writer has stopped.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// In-process result table keyed by [`RowKey`].
#[derive(Default)]
pub struct MemoryTable {
    rows: Mutex<BTreeMap<RowKey, WindowRow>>,
    writes: AtomicU64,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RowKey) -> Option<WindowRow> {
        self.lock().get(key).cloned()
    }

    pub fn rows(&self) -> Vec<WindowRow> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Upserts accepted so far, including overwrites.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<RowKey, WindowRow>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WindowSink for MemoryTable {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, row: &WindowRow) -> Result<(), SinkError> {
        self.lock().insert(row.key(), row.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(group: &str, count: u64) -> WindowRow {
        let key = WindowKey {
            group_key: 42,
            window_start: 0,
            window_end: 60_000_000_000,
        };
        let state = WindowState {
            count,
            sum: count as f64,
            sample_tag: "42_t".into(),
            ..WindowState::default()
        };
        WindowRow::from_window(&key, &state, group)
    }

    #[tokio::test]
    async fn upsert_overwrites_same_key_only() {
        let table = MemoryTable::new();
        table.upsert(&row("g1", 1)).await.unwrap();
        table.upsert(&row("g1", 2)).await.unwrap();
        table.upsert(&row("g2", 7)).await.unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.write_count(), 3);
        assert_eq!(table.get(&row("g1", 0).key()).unwrap().count, 2);
        assert_eq!(table.get(&row("g2", 0).key()).unwrap().count, 7);
    }

    #[test]
    fn row_serializes_rfc3339_times() {
        let json = serde_json::to_value(row("g", 3)).unwrap();
        assert_eq!(json["window_start"], "1970-01-01T00:00:00Z");
        assert_eq!(json["window_end"], "1970-01-01T00:01:00Z");
        assert_eq!(json["user_id"], 42);
        assert_eq!(json["event_hash"], "42_t");
    }
}
