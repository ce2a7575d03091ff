use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tb_config::MetricsConfig;
use tb_core::finalize::SweepReport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WRITE_BUCKETS_SECONDS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Fixed-bucket histogram; each observation lands in exactly one bucket and
/// the cumulative form is produced at render time.
struct Histogram {
    bounds_nanos: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_nanos: AtomicU64,
}

impl Histogram {
    fn with_bounds(bounds: &[f64]) -> Self {
        let bounds_nanos: Vec<u64> = bounds.iter().map(|s| (s * 1e9) as u64).collect();
        let buckets = (0..=bounds_nanos.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds_nanos,
            buckets,
            sum_nanos: AtomicU64::new(0),
        }
    }

    fn observe(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.sum_nanos.fetch_add(nanos, Ordering::Relaxed);
        let idx = self
            .bounds_nanos
            .iter()
            .position(|b| nanos <= *b)
            .unwrap_or(self.bounds_nanos.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }
}

fn load(v: &AtomicU64) -> u64 {
    v.load(Ordering::Relaxed)
}

fn add(v: &AtomicU64, n: u64) {
    v.fetch_add(n, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Per-group counters
// ---------------------------------------------------------------------------

/// Counters for one consumer group. Updated by its reader, shard and commit
/// tasks without locking.
pub struct GroupMetrics {
    records_read: AtomicU64,
    parse_errors: AtomicU64,
    read_errors: AtomicU64,
    events_folded: AtomicU64,
    late_dropped: AtomicU64,
    replay_skipped: AtomicU64,
    windows_closed: AtomicU64,
    windows_written: AtomicU64,
    windows_suppressed: AtomicU64,
    windows_expired: AtomicU64,
    sink_retries: AtomicU64,
    dead_lettered: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    open_windows: Vec<AtomicU64>,
    pending_windows: Vec<AtomicU64>,
    sink_write_seconds: Histogram,
}

impl GroupMetrics {
    fn new(shards: usize) -> Self {
        let gauges = || -> Vec<AtomicU64> { (0..shards).map(|_| AtomicU64::new(0)).collect() };
        Self {
            records_read: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            events_folded: AtomicU64::new(0),
            late_dropped: AtomicU64::new(0),
            replay_skipped: AtomicU64::new(0),
            windows_closed: AtomicU64::new(0),
            windows_written: AtomicU64::new(0),
            windows_suppressed: AtomicU64::new(0),
            windows_expired: AtomicU64::new(0),
            sink_retries: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
            open_windows: gauges(),
            pending_windows: gauges(),
            sink_write_seconds: Histogram::with_bounds(WRITE_BUCKETS_SECONDS),
        }
    }

    pub fn add_records_read(&self, n: usize) {
        add(&self.records_read, n as u64);
    }

    pub fn inc_parse_error(&self) {
        add(&self.parse_errors, 1);
    }

    pub fn inc_read_error(&self) {
        add(&self.read_errors, 1);
    }

    pub fn inc_folded(&self) {
        add(&self.events_folded, 1);
    }

    pub fn inc_late_dropped(&self) {
        add(&self.late_dropped, 1);
    }

    pub fn inc_replay_skipped(&self) {
        add(&self.replay_skipped, 1);
    }

    pub fn inc_commit(&self) {
        add(&self.commits, 1);
    }

    pub fn inc_commit_failure(&self) {
        add(&self.commit_failures, 1);
    }

    pub fn add_sweep(&self, report: &SweepReport) {
        add(&self.windows_closed, report.closed as u64);
        add(&self.windows_written, report.written as u64);
        add(&self.windows_suppressed, report.suppressed as u64);
        add(&self.windows_expired, report.expired as u64);
        add(&self.dead_lettered, report.dead_lettered as u64);
        add(&self.sink_retries, report.retries);
        for elapsed in &report.write_latencies {
            self.sink_write_seconds.observe(*elapsed);
        }
    }

    pub fn set_shard_windows(&self, shard: usize, open: usize, pending: usize) {
        if let Some(g) = self.open_windows.get(shard) {
            g.store(open as u64, Ordering::Relaxed);
        }
        if let Some(g) = self.pending_windows.get(shard) {
            g.store(pending as u64, Ordering::Relaxed);
        }
    }

    pub fn records_read(&self) -> u64 {
        load(&self.records_read)
    }

    pub fn parse_errors(&self) -> u64 {
        load(&self.parse_errors)
    }

    pub fn late_dropped(&self) -> u64 {
        load(&self.late_dropped)
    }

    pub fn replay_skipped(&self) -> u64 {
        load(&self.replay_skipped)
    }

    pub fn windows_written(&self) -> u64 {
        load(&self.windows_written)
    }

    pub fn windows_suppressed(&self) -> u64 {
        load(&self.windows_suppressed)
    }

    pub fn windows_expired(&self) -> u64 {
        load(&self.windows_expired)
    }

    pub fn commits(&self) -> u64 {
        load(&self.commits)
    }

    fn counters(&self) -> [(&'static str, u64); 14] {
        [
            ("tb_records_read_total", load(&self.records_read)),
            ("tb_parse_errors_total", load(&self.parse_errors)),
            ("tb_read_errors_total", load(&self.read_errors)),
            ("tb_events_folded_total", load(&self.events_folded)),
            ("tb_late_dropped_total", load(&self.late_dropped)),
            ("tb_replay_skipped_total", load(&self.replay_skipped)),
            ("tb_windows_closed_total", load(&self.windows_closed)),
            ("tb_windows_written_total", load(&self.windows_written)),
            ("tb_windows_suppressed_total", load(&self.windows_suppressed)),
            ("tb_windows_expired_total", load(&self.windows_expired)),
            ("tb_sink_retries_total", load(&self.sink_retries)),
            ("tb_dead_lettered_total", load(&self.dead_lettered)),
            ("tb_commits_total", load(&self.commits)),
            ("tb_commit_failures_total", load(&self.commit_failures)),
        ]
    }

    fn open_gauges(&self) -> &[AtomicU64] {
        &self.open_windows
    }

    fn pending_gauges(&self) -> &[AtomicU64] {
        &self.pending_windows
    }

    fn open_total(&self) -> u64 {
        self.open_windows.iter().map(load).sum()
    }
}

// ---------------------------------------------------------------------------
// RuntimeMetrics
// ---------------------------------------------------------------------------

/// Metrics for every consumer group of the engine. The group set is fixed at
/// startup so the hot path never allocates.
pub struct RuntimeMetrics {
    groups: BTreeMap<String, Arc<GroupMetrics>>,
}

impl RuntimeMetrics {
    pub fn new(group_names: &[String], shards: usize) -> Self {
        let groups = group_names
            .iter()
            .map(|name| (name.clone(), Arc::new(GroupMetrics::new(shards))))
            .collect();
        Self { groups }
    }

    pub fn group(&self, name: &str) -> Option<Arc<GroupMetrics>> {
        self.groups.get(name).cloned()
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(8 * 1024);
        let mut typed = BTreeSet::new();

        let snapshots: Vec<(&String, [(&'static str, u64); 14])> = self
            .groups
            .iter()
            .map(|(name, m)| (name, m.counters()))
            .collect();
        for family in 0..13 {
            for (group, counters) in &snapshots {
                let (name, value) = counters[family];
                render_type_once(&mut out, &mut typed, name, "counter");
                let _ = writeln!(
                    out,
                    "{name}{} {value}",
                    format_labels(&[("consumer_group", group.as_str())])
                );
            }
        }

        for (name, pick) in [
            ("tb_open_windows", GroupMetrics::open_gauges as fn(&GroupMetrics) -> &[AtomicU64]),
            ("tb_pending_windows", GroupMetrics::pending_gauges),
        ] {
            for (group, m) in &self.groups {
                for (shard, v) in pick(m).iter().enumerate() {
                    render_type_once(&mut out, &mut typed, name, "gauge");
                    let shard = shard.to_string();
                    let _ = writeln!(
                        out,
                        "{name}{} {}",
                        format_labels(&[("consumer_group", group), ("shard", &shard)]),
                        load(v)
                    );
                }
            }
        }

        for (group, m) in &self.groups {
            render_histogram(
                &mut out,
                &mut typed,
                "tb_sink_write_seconds",
                &[("consumer_group", group)],
                &m.sink_write_seconds,
            );
        }
        out
    }

    pub fn summary_line(&self) -> String {
        let mut line = String::new();
        for (group, m) in &self.groups {
            if !line.is_empty() {
                line.push_str(" | ");
            }
            let _ = write!(
                line,
                "{group}: read={} parse_err={} late={} written={} suppressed={} expired={} open={} commits={}",
                m.records_read(),
                m.parse_errors(),
                m.late_dropped(),
                m.windows_written(),
                m.windows_suppressed(),
                m.windows_expired(),
                m.open_total(),
                m.commits(),
            );
        }
        line
    }
}

fn render_type_once(
    out: &mut String,
    typed: &mut BTreeSet<&'static str>,
    name: &'static str,
    kind: &str,
) {
    if typed.insert(name) {
        let _ = writeln!(out, "# TYPE {name} {kind}");
    }
}

fn render_histogram(
    out: &mut String,
    typed: &mut BTreeSet<&'static str>,
    name: &'static str,
    labels: &[(&str, &str)],
    histogram: &Histogram,
) {
    render_type_once(out, typed, name, "histogram");
    let mut cumulative = 0u64;
    let bounds = histogram
        .bounds_nanos
        .iter()
        .map(|b| format!("{:.6}", *b as f64 / 1e9))
        .chain(std::iter::once("+Inf".to_string()));
    for (bucket, le) in histogram.buckets.iter().zip(bounds) {
        cumulative = cumulative.saturating_add(load(bucket));
        let mut all = labels.to_vec();
        all.push(("le", le.as_str()));
        let _ = writeln!(out, "{name}_bucket{} {cumulative}", format_labels(&all));
    }
    let sum = load(&histogram.sum_nanos) as f64 / 1e9;
    let _ = writeln!(out, "{name}_sum{} {sum}", format_labels(labels));
    let _ = writeln!(out, "{name}_count{} {cumulative}", format_labels(labels));
}

fn format_labels(labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let body = labels
        .iter()
        .map(|(k, v)| {
            let escaped = v
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n");
            format!("{k}=\"{escaped}\"")
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{body}}}")
}

// ---------------------------------------------------------------------------
// Exporter task
// ---------------------------------------------------------------------------

/// Logs a summary line every `report_interval` and, when a listener is
/// given, serves `GET /metrics` in Prometheus text format.
pub async fn run_metrics_task(
    metrics: Arc<RuntimeMetrics>,
    config: MetricsConfig,
    listener: Option<TcpListener>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    tb_info!(
        sys,
        listen = %config.listen,
        interval = %config.report_interval,
        "metrics exporter started"
    );

    let mut tick = tokio::time::interval(config.report_interval.as_duration());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                tb_info!(res, summary = %metrics.summary_line(), "metrics snapshot");
            }
            accepted = accept(listener.as_ref()) => {
                let (stream, _) = accepted?;
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, metrics).await {
                        tb_debug!(sys, error = %e, "metrics connection failed");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn accept(
    listener: Option<&TcpListener>,
) -> std::io::Result<(TcpStream, std::net::SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    metrics: Arc<RuntimeMetrics>,
) -> anyhow::Result<()> {
    let mut buf = [0u8; 512];
    let n = match timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
        Ok(read) => read?,
        Err(_) => return Ok(()),
    };
    let wants_metrics = std::str::from_utf8(&buf[..n])
        .map(|req| req.starts_with("GET /metrics"))
        .unwrap_or(false);

    let response = if wants_metrics {
        let body = metrics.render_prometheus();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };
    timeout(Duration::from_secs(2), stream.write_all(response.as_bytes())).await??;
    let _ = timeout(Duration::from_secs(1), stream.shutdown()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> Vec<String> {
        vec!["demo-group-1".to_string(), "demo-group-2".to_string()]
    }

    #[test]
    fn type_line_rendered_once_per_family() {
        let metrics = RuntimeMetrics::new(&groups(), 2);
        let text = metrics.render_prometheus();
        assert_eq!(
            text.matches("# TYPE tb_records_read_total counter").count(),
            1
        );
        assert_eq!(text.matches("# TYPE tb_open_windows gauge").count(), 1);
        assert_eq!(
            text.matches("# TYPE tb_sink_write_seconds histogram").count(),
            1
        );
    }

    #[test]
    fn counters_are_labelled_by_group() {
        let metrics = RuntimeMetrics::new(&groups(), 1);
        let g1 = metrics.group("demo-group-1").unwrap();
        g1.add_records_read(3);
        g1.inc_parse_error();
        let text = metrics.render_prometheus();
        assert!(text.contains("tb_records_read_total{consumer_group=\"demo-group-1\"} 3"));
        assert!(text.contains("tb_records_read_total{consumer_group=\"demo-group-2\"} 0"));
        assert!(text.contains("tb_parse_errors_total{consumer_group=\"demo-group-1\"} 1"));
        assert!(metrics.group("missing").is_none());
    }

    #[test]
    fn sweep_report_feeds_histogram() {
        let metrics = RuntimeMetrics::new(&groups(), 1);
        let g = metrics.group("demo-group-2").unwrap();
        let report = SweepReport {
            closed: 2,
            written: 2,
            expired: 1,
            write_latencies: vec![Duration::from_millis(3), Duration::from_millis(7)],
            ..Default::default()
        };
        g.add_sweep(&report);
        let text = metrics.render_prometheus();
        assert!(text.contains(
            "tb_sink_write_seconds_bucket{consumer_group=\"demo-group-2\",le=\"+Inf\"} 2"
        ));
        assert!(text.contains("tb_sink_write_seconds_count{consumer_group=\"demo-group-2\"} 2"));
        assert_eq!(g.windows_written(), 2);
        assert!(text.contains("tb_windows_expired_total{consumer_group=\"demo-group-2\"} 1"));
    }

    #[test]
    fn shard_gauges_and_summary() {
        let metrics = RuntimeMetrics::new(&groups(), 2);
        let g = metrics.group("demo-group-1").unwrap();
        g.set_shard_windows(1, 5, 1);
        g.set_shard_windows(7, 9, 9);
        let text = metrics.render_prometheus();
        assert!(text.contains("tb_open_windows{consumer_group=\"demo-group-1\",shard=\"1\"} 5"));
        assert!(metrics.summary_line().contains("demo-group-1: read=0"));
        assert!(metrics.summary_line().contains("open=5"));
    }
}
