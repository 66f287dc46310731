//! Byte and file counters for a running transfer batch.
//!
//! Counters are atomics so concurrent transfer tasks can update them without
//! contention. Reports to the status sink are throttled to one per interval,
//! except the final one from [`ProgressTracker::complete`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::sync::status::StatusSink;

/// Minimum time between two progress reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(250);

/// Point-in-time view of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub files_done: u64,
    pub total_files: u64,
    pub current_path: Option<String>,
    pub elapsed: Duration,
    /// Set on the report emitted by `complete()`.
    pub finished: bool,
}

impl ProgressSnapshot {
    /// Completion in percent (0.0 - 100.0). Falls back to the file count when
    /// the batch carries no bytes.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes > 0 {
            (self.bytes_done as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        } else if self.total_files > 0 {
            (self.files_done as f64 / self.total_files as f64 * 100.0).min(100.0)
        } else if self.finished {
            100.0
        } else {
            0.0
        }
    }

    /// Average throughput in bytes per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_done as f64 / secs
        } else {
            0.0
        }
    }

    /// Estimated time left, `None` until some bytes have moved.
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.throughput();
        if rate <= 0.0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.bytes_done);
        Duration::try_from_secs_f64(remaining as f64 / rate).ok()
    }
}

#[derive(Debug, Default)]
struct Clock {
    started: Option<Instant>,
    last_report: Option<Instant>,
    current_path: Option<String>,
}

/// Thread-safe progress accounting for one session.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<Inner>,
}

struct Inner {
    target: String,
    sink: Arc<dyn StatusSink>,
    interval: Duration,
    bytes_done: AtomicU64,
    total_bytes: AtomicU64,
    files_done: AtomicU64,
    total_files: AtomicU64,
    clock: Mutex<Clock>,
}

impl ProgressTracker {
    pub fn new(target: impl Into<String>, sink: Arc<dyn StatusSink>) -> Self {
        Self::with_interval(target, sink, DEFAULT_REPORT_INTERVAL)
    }

    pub fn with_interval(
        target: impl Into<String>,
        sink: Arc<dyn StatusSink>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                target: target.into(),
                sink,
                interval,
                bytes_done: AtomicU64::new(0),
                total_bytes: AtomicU64::new(0),
                files_done: AtomicU64::new(0),
                total_files: AtomicU64::new(0),
                clock: Mutex::new(Clock::default()),
            }),
        }
    }

    /// Reset the counters for a new batch.
    pub fn start_transfer(&self, total_bytes: u64, total_files: u64) {
        let inner = &self.inner;
        inner.bytes_done.store(0, Ordering::Relaxed);
        inner.files_done.store(0, Ordering::Relaxed);
        inner.total_bytes.store(total_bytes, Ordering::Relaxed);
        inner.total_files.store(total_files, Ordering::Relaxed);

        let mut clock = self.clock();
        *clock = Clock {
            started: Some(Instant::now()),
            ..Clock::default()
        };
    }

    /// Record `bytes_delta` more bytes written while working on `current_path`.
    pub fn update(&self, bytes_delta: u64, current_path: &str) {
        self.inner.bytes_done.fetch_add(bytes_delta, Ordering::Relaxed);
        self.clock().current_path = Some(current_path.to_string());
        self.maybe_report();
    }

    /// Count one file as finished, whatever its outcome.
    pub fn file_done(&self) {
        self.inner.files_done.fetch_add(1, Ordering::Relaxed);
        self.maybe_report();
    }

    /// Emit the final report for the batch. Never throttled.
    pub fn complete(&self) -> ProgressSnapshot {
        let mut snapshot = self.snapshot();
        snapshot.finished = true;
        self.clock().last_report = Some(Instant::now());
        self.inner.sink.on_progress(&self.inner.target, &snapshot);
        snapshot
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = &self.inner;
        let clock = self.clock();
        ProgressSnapshot {
            bytes_done: inner.bytes_done.load(Ordering::Relaxed),
            total_bytes: inner.total_bytes.load(Ordering::Relaxed),
            files_done: inner.files_done.load(Ordering::Relaxed),
            total_files: inner.total_files.load(Ordering::Relaxed),
            current_path: clock.current_path.clone(),
            elapsed: clock.started.map(|s| s.elapsed()).unwrap_or_default(),
            finished: false,
        }
    }

    fn maybe_report(&self) {
        let now = Instant::now();
        {
            let mut clock = self.clock();
            if let Some(last) = clock.last_report {
                if now.duration_since(last) < self.inner.interval {
                    return;
                }
            }
            clock.last_report = Some(now);
        }
        let snapshot = self.snapshot();
        self.inner.sink.on_progress(&self.inner.target, &snapshot);
    }

    fn clock(&self) -> std::sync::MutexGuard<'_, Clock> {
        self.inner
            .clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
