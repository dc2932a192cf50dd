//! Metric sinks and throughput trackers.
//!
//! * **[`MetricsSink`]** — scalar summaries keyed by tag and step.
//!   [`CsvSummaryWriter`] persists them; [`MemorySink`] keeps them in RAM.
//! * **[`RateTracker`]** — smoothed and global examples/sec.
//! * **[`LatencyTracker`]** — per-step latencies reported as medians.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

// ── Sinks ───────────────────────────────────────────────────────────────────

/// Receives scalar summaries. Implementations must not fail the caller.
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize);

    fn flush(&mut self) {}
}

/// A sink shared between the scheduler and the training loop.
pub type SharedSink = Arc<Mutex<dyn MetricsSink + Send>>;

/// Write several scalars at the same step.
pub fn write_to_summary(sink: Option<&SharedSink>, step: usize, scalars: &[(&str, f64)]) {
    if let Some(sink) = sink {
        let mut sink = sink.lock();
        for (tag, value) in scalars {
            sink.add_scalar(tag, *value, step);
        }
    }
}

/// In-memory sink; points are grouped by tag and kept in arrival order.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    series: BTreeMap<String, Vec<(usize, f64)>>,
}

impl MemorySink {
    /// All `(step, value)` points recorded under `tag`.
    pub fn series(&self, tag: &str) -> &[(usize, f64)] {
        self.series.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        self.series
            .entry(tag.to_string())
            .or_default()
            .push((step, value));
    }
}

/// Appends `tag,step,value` rows to `<logdir>/summary.csv`.
pub struct CsvSummaryWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl CsvSummaryWriter {
    pub const FILE_NAME: &'static str = "summary.csv";

    /// Create `logdir` if needed and start a fresh summary file in it.
    pub fn create(logdir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(logdir)?;
        let path = logdir.join(Self::FILE_NAME);
        let mut out = BufWriter::new(File::create(&path)?);
        writeln!(out, "tag,step,value")?;
        Ok(Self { path, out })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for CsvSummaryWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        if let Err(e) = writeln!(self.out, "{tag},{step},{value}") {
            tracing::warn!(path = %self.path.display(), error = %e, "summary write failed");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "summary flush failed");
        }
    }
}

impl Drop for CsvSummaryWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

// ── Rate tracker ────────────────────────────────────────────────────────────

/// Examples/sec since the last report (exponentially smoothed) and since start.
#[derive(Debug, Clone)]
pub struct RateTracker {
    smooth_factor: f64,
    start: Instant,
    partial_time: Instant,
    partial_count: f64,
    partial_rate: Option<f64>,
    count: f64,
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new(0.8)
    }
}

impl RateTracker {
    pub fn new(smooth_factor: f64) -> Self {
        let now = Instant::now();
        Self {
            smooth_factor,
            start: now,
            partial_time: now,
            partial_count: 0.0,
            partial_rate: None,
            count: 0.0,
        }
    }

    pub fn add(&mut self, count: usize) {
        self.count += count as f64;
    }

    /// Smoothed rate since the previous call; resets the partial window.
    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&mut self, now: Instant) -> f64 {
        let delta = now.duration_since(self.partial_time).as_secs_f64();
        if delta <= 0.0 {
            return 0.0;
        }
        let current = self.count / delta;
        let smoothed = match self.partial_rate {
            None => current,
            Some(prev) => (1.0 - self.smooth_factor) * current + self.smooth_factor * prev,
        };
        self.partial_count += self.count;
        self.count = 0.0;
        self.partial_time = now;
        self.partial_rate = Some(smoothed);
        smoothed
    }

    /// Average rate since construction.
    pub fn global_rate(&self) -> f64 {
        self.global_rate_at(Instant::now())
    }

    fn global_rate_at(&self, now: Instant) -> f64 {
        let delta = now.duration_since(self.start).as_secs_f64();
        if delta > 0.0 {
            (self.partial_count + self.count) / delta
        } else {
            0.0
        }
    }
}

// ── Latency tracker ─────────────────────────────────────────────────────────

/// Linear-interpolated percentile (`q` in `0..=100`) of `values`.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Seconds spent per batch in the whole step, the forward pass and the backward pass.
#[derive(Debug, Default, Clone)]
pub struct LatencyTracker {
    pub step: Vec<f64>,
    pub forward: Vec<f64>,
    pub backward: Vec<f64>,
}

/// Medians of a [`LatencyTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub step_p50: f64,
    pub forward_p50: f64,
    pub backward_p50: f64,
    /// `batch_size / step_p50`.
    pub rate_p50: f64,
}

impl LatencyTracker {
    pub fn record(&mut self, step: f64, forward: f64, backward: f64) {
        self.step.push(step);
        self.forward.push(forward);
        self.backward.push(backward);
    }

    pub fn summary(&self, batch_size: usize) -> LatencySummary {
        let step_p50 = percentile(&self.step, 50.0);
        LatencySummary {
            step_p50,
            forward_p50: percentile(&self.forward, 50.0),
            backward_p50: percentile(&self.backward, 50.0),
            rate_p50: if step_p50 > 0.0 {
                batch_size as f64 / step_p50
            } else {
                0.0
            },
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[3.0], 50.0), 3.0);
        assert_eq!(percentile(&[4.0, 1.0, 3.0], 50.0), 3.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 50.0), 2.5);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 100.0), 4.0);
    }

    #[test]
    fn latency_summary_rate() {
        let mut t = LatencyTracker::default();
        t.record(0.5, 0.2, 0.3);
        t.record(0.5, 0.1, 0.4);
        t.record(2.0, 0.1, 1.9);
        let s = t.summary(64);
        assert_eq!(s.step_p50, 0.5);
        assert_eq!(s.forward_p50, 0.1);
        assert_eq!(s.backward_p50, 0.4);
        assert_eq!(s.rate_p50, 128.0);
    }

    #[test]
    fn rate_tracker_smooths_successive_windows() {
        let mut t = RateTracker::new(0.5);
        let start = t.start;

        t.add(100);
        let first = t.rate_at(start + Duration::from_secs(1));
        assert!((first - 100.0).abs() < 1e-9);

        t.add(300);
        let second = t.rate_at(start + Duration::from_secs(2));
        // 0.5 * 300 + 0.5 * 100
        assert!((second - 200.0).abs() < 1e-9);

        let global = t.global_rate_at(start + Duration::from_secs(4));
        assert!((global - 100.0).abs() < 1e-9);
    }

    #[test]
    fn memory_sink_groups_by_tag() {
        let mut sink = MemorySink::default();
        sink.add_scalar("a", 1.0, 0);
        sink.add_scalar("b", 2.0, 0);
        sink.add_scalar("a", 3.0, 5);
        assert_eq!(sink.series("a"), &[(0, 1.0), (5, 3.0)]);
        assert!(sink.series("missing").is_empty());
        assert_eq!(sink.tags().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn csv_writer_persists_rows() {
        let dir = tempfile::tempdir().unwrap();
        let logdir = dir.path().join("run");
        let writer = CsvSummaryWriter::create(&logdir).unwrap();
        let path = writer.path().to_path_buf();
        let shared: SharedSink = Arc::new(Mutex::new(writer));
        write_to_summary(Some(&shared), 3, &[("Accuracy/test", 12.5), ("loss", 0.25)]);
        drop(shared);

        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines, vec!["tag,step,value", "Accuracy/test,3,12.5", "loss,3,0.25"]);
    }
}
