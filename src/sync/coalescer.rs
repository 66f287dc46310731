//! Debouncing of raw watcher events.
//!
//! Editors often save with several writes in a row. Each path keeps one
//! pending entry whose timer is re-armed on every new event; the entry is
//! emitted once the path has been quiet for the whole debounce window.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::sync::watcher::{ChangeKind, RawEvent};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// A settled change for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// When the first event of the coalesced run was seen.
    pub observed_at: DateTime<Utc>,
}

/// Control messages for a running coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalescerCommand {
    /// Emit everything pending now.
    Flush,
    /// Discard everything pending and exit.
    Stop,
}

#[derive(Debug, Clone)]
struct Pending {
    kind: ChangeKind,
    observed_at: DateTime<Utc>,
    deadline: Instant,
    /// Arrival order, so batches list paths in the order first seen.
    seq: u64,
}

#[derive(Debug)]
pub struct ChangeCoalescer {
    window: Duration,
    pending: HashMap<PathBuf, Pending>,
    next_seq: u64,
}

impl ChangeCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record a raw event seen at `now`. A path already pending takes the
    /// newest kind, keeps its first observation time and restarts its timer.
    pub fn push(&mut self, raw: RawEvent, now: Instant) {
        let deadline = now + self.window;
        match self.pending.get_mut(&raw.path) {
            Some(entry) => {
                trace!(path = %raw.path.display(), kind = ?raw.kind, "coalesced");
                entry.kind = raw.kind;
                entry.deadline = deadline;
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.pending.insert(
                    raw.path,
                    Pending {
                        kind: raw.kind,
                        observed_at: Utc::now(),
                        deadline,
                        seq,
                    },
                );
            }
        }
    }

    /// Earliest timer among pending paths.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every path whose timer expired at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        self.take(due)
    }

    /// Remove and return everything pending.
    pub fn flush(&mut self) -> Vec<ChangeEvent> {
        let all: Vec<PathBuf> = self.pending.keys().cloned().collect();
        self.take(all)
    }

    /// Drop everything pending. Returns how many entries were discarded.
    pub fn discard(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    fn take(&mut self, paths: Vec<PathBuf>) -> Vec<ChangeEvent> {
        let mut taken: Vec<(u64, ChangeEvent)> = paths
            .into_iter()
            .filter_map(|path| {
                self.pending.remove(&path).map(|p| {
                    (
                        p.seq,
                        ChangeEvent {
                            path,
                            kind: p.kind,
                            observed_at: p.observed_at,
                        },
                    )
                })
            })
            .collect();
        taken.sort_by_key(|(seq, _)| *seq);
        taken.into_iter().map(|(_, ev)| ev).collect()
    }

    /// Drive the coalescer: read raw events, emit settled batches on `out`.
    ///
    /// Returns when the raw stream closes (after flushing), when `Stop` is
    /// received (pending events are discarded) or when `out` is closed.
    pub async fn run(
        mut self,
        mut raw_rx: mpsc::Receiver<RawEvent>,
        mut control_rx: mpsc::Receiver<CoalescerCommand>,
        out: mpsc::Sender<Vec<ChangeEvent>>,
    ) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;

                cmd = control_rx.recv() => match cmd {
                    Some(CoalescerCommand::Flush) => {
                        let batch = self.flush();
                        if !batch.is_empty() && out.send(batch).await.is_err() {
                            return;
                        }
                    }
                    Some(CoalescerCommand::Stop) | None => {
                        let dropped = self.discard();
                        debug!(dropped, "coalescer stopped");
                        return;
                    }
                },

                raw = raw_rx.recv() => match raw {
                    Some(raw) => self.push(raw, Instant::now()),
                    None => {
                        let batch = self.flush();
                        if !batch.is_empty() {
                            let _ = out.send(batch).await;
                        }
                        return;
                    }
                },

                _ = sleep_until_opt(deadline) => {
                    let batch = self.take_due(Instant::now());
                    if !batch.is_empty() {
                        debug!(count = batch.len(), "changes settled");
                        if out.send(batch).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl Default for ChangeCoalescer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
