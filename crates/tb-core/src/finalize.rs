//! Window finalization: close what the watermark has passed, write it to the
//! sink with bounded retry, evict on success. Windows left behind the
//! retention horizon are evicted without a write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tb_config::SinkConfig;

use crate::sink::{SinkError, WindowRow, WindowSink};
use crate::window::WindowKey;
use crate::worker::WindowWorker;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for sink writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SinkConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial: config.backoff_initial.as_duration(),
            max: config.backoff_max.as_duration(),
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

// ---------------------------------------------------------------------------
// SweepReport
// ---------------------------------------------------------------------------

/// Summary of a single [`Finalizer::sweep`] call.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Windows moved from `Open` to `Closing` by this sweep.
    pub closed: usize,
    /// Open windows evicted by retention, never written.
    pub expired: usize,
    pub written: usize,
    pub suppressed: usize,
    /// Windows left `Closing` after exhausting their retries.
    pub retry_pending: usize,
    pub dead_lettered: usize,
    pub retries: u64,
    pub write_latencies: Vec<Duration>,
}

// ---------------------------------------------------------------------------
// Finalizer
// ---------------------------------------------------------------------------

pub struct Finalizer {
    consumer_group: String,
    count_ceiling: u64,
    sink: Arc<dyn WindowSink>,
    dead_letter: Option<Arc<dyn WindowSink>>,
    retry: RetryPolicy,
}

enum WriteOutcome {
    Written,
    Pending,
    Rejected(SinkError),
}

impl Finalizer {
    pub fn new(
        consumer_group: impl Into<String>,
        count_ceiling: u64,
        sink: Arc<dyn WindowSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            count_ceiling,
            sink,
            dead_letter: None,
            retry,
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn WindowSink>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Run one finalization pass over `worker`.
    ///
    /// Every `Closing` window, old or newly closed, is attempted in key
    /// order. Windows above the count ceiling are evicted without a write.
    /// A transient failure that outlasts the retry budget leaves the window
    /// `Closing` for the next sweep; a permanent one sends the row to the
    /// dead letter (when configured) and releases the window.
    ///
    /// Only the watermark closes windows. Retention runs after closing, so a
    /// window the watermark has passed is always written rather than expired.
    pub async fn sweep(&self, worker: &mut WindowWorker) -> SweepReport {
        let mut report = SweepReport {
            closed: worker.begin_close(),
            ..SweepReport::default()
        };

        for (key, state) in worker.expire_stale() {
            log::warn!(
                "expiring window group_key={} start={} count={} behind retention horizon; not written",
                key.group_key,
                key.window_start,
                state.count
            );
            report.expired += 1;
        }

        for key in worker.closing_keys() {
            let Some(state) = worker.closing(&key) else {
                continue;
            };
            if state.count > self.count_ceiling {
                log::debug!(
                    "suppressing window group_key={} start={} count={} ceiling={}",
                    key.group_key,
                    key.window_start,
                    state.count,
                    self.count_ceiling
                );
                worker.complete(&key);
                report.suppressed += 1;
                continue;
            }

            let row = WindowRow::from_window(&key, state, &self.consumer_group);
            match self.write_with_retry(&row, &mut report).await {
                WriteOutcome::Written => {
                    worker.complete(&key);
                    report.written += 1;
                }
                WriteOutcome::Pending => {
                    log::warn!(
                        "window group_key={} start={} still pending after {} attempts",
                        key.group_key,
                        key.window_start,
                        self.retry.max_attempts
                    );
                    report.retry_pending += 1;
                }
                WriteOutcome::Rejected(err) => {
                    self.reject(&key, &row, &err).await;
                    worker.complete(&key);
                    report.dead_lettered += 1;
                }
            }
        }

        worker.purge_tombstones();
        report
    }

    async fn write_with_retry(&self, row: &WindowRow, report: &mut SweepReport) -> WriteOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = self.sink.upsert(row).await;
            report.write_latencies.push(started.elapsed());
            match result {
                Ok(()) => return WriteOutcome::Written,
                Err(err) if !err.is_transient() => return WriteOutcome::Rejected(err),
                Err(err) => {
                    if attempt >= self.retry.max_attempts {
                        return WriteOutcome::Pending;
                    }
                    let delay = self.retry.backoff(attempt);
                    log::debug!(
                        "sink {} failed (attempt {attempt}): {err}; retrying in {delay:?}",
                        self.sink.name()
                    );
                    report.retries += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn reject(&self, key: &WindowKey, row: &WindowRow, err: &SinkError) {
        let row_json = serde_json::to_string(row).unwrap_or_default();
        log::error!(
            "sink {} rejected window group_key={} start={}: {err}; row={row_json}",
            self.sink.name(),
            key.group_key,
            key.window_start
        );
        if let Some(dead_letter) = &self.dead_letter {
            if let Err(e) = dead_letter.upsert(row).await {
                log::error!("dead letter {} write failed: {e}", dead_letter.name());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
