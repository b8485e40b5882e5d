//! Batch progress counters and periodic progress logging.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counters shared between transfer workers and the progress reporter.
#[derive(Debug)]
pub struct BatchProgress {
    total_tasks: usize,
    started: Instant,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    retries: AtomicUsize,
    bytes_uploaded: AtomicU64,
}

/// Point-in-time copy of [`BatchProgress`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub total_tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retries: usize,
    pub bytes_uploaded: u64,
    pub elapsed: Duration,
}

impl BatchProgress {
    pub fn new(total_tasks: usize) -> Self {
        Self {
            total_tasks,
            started: Instant::now(),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            retries: AtomicUsize::new(0),
            bytes_uploaded: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, bytes: u64) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total_tasks: self.total_tasks,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

impl ProgressSnapshot {
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn percent(&self) -> f64 {
        if self.total_tasks == 0 {
            100.0
        } else {
            (self.finished() as f64 / self.total_tasks as f64 * 100.0).min(100.0)
        }
    }

    /// Average upload speed since the batch started
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes_uploaded as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// Log a progress line every `interval` until `stop` is cancelled.
pub fn spawn_reporter(progress: Arc<BatchProgress>, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.cancelled() => break,
            }

            let snap = progress.snapshot();
            info!(
                "Transfer progress: {}/{} tasks ({:.1}%), {} failed, {} retries, {} at {}",
                snap.finished(),
                snap.total_tasks,
                snap.percent(),
                snap.failed,
                snap.retries,
                format_bytes(snap.bytes_uploaded),
                format_speed(snap.bytes_per_second()),
            );
        }
    })
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let progress = BatchProgress::new(4);
        progress.record_success(1024);
        progress.record_success(2048);
        progress.record_retry();
        progress.record_failure();

        let snap = progress.snapshot();
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.bytes_uploaded, 3072);
        assert_eq!(snap.finished(), 3);
        assert!((snap.percent() - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_empty_batch_is_complete() {
        assert!((BatchProgress::new(0).snapshot().percent() - 100.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_cancel() {
        let stop = CancellationToken::new();
        let handle = spawn_reporter(Arc::new(BatchProgress::new(1)), Duration::from_millis(10), stop.clone());
        stop.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_format_speed_and_duration() {
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
