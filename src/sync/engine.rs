//! Sync session driver.
//!
//! A [`SyncOrchestrator`] owns one transport adapter, one ignore rule set and
//! one progress tracker for the lifetime of a deploy or watch run. Full syncs
//! walk the source tree; watch sessions feed on coalesced change batches.
//! Every task runs under its destination's fingerprint lock and a
//! session-wide concurrency limit, wrapped in the retry policy.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use jwalk::WalkDir;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::fs::{create_adapter, RemoteStat, TransportAdapter, TransportTarget};
use crate::sync::coalescer::{ChangeCoalescer, ChangeEvent, CoalescerCommand, DEFAULT_DEBOUNCE};
use crate::sync::ignore::{relative_slash_path, IgnoreMatcher};
use crate::sync::progress::ProgressTracker;
use crate::sync::retry::{Backoff, RetryPolicy};
use crate::sync::status::StatusSink;
use crate::sync::task::{FingerprintLocks, TaskKind, TransferResult, TransferStatus, TransferTask};
use crate::sync::watcher::{ChangeKind, ChangeWatcher, DEFAULT_CHANNEL_CAPACITY};

/// Capacity of the coalescer to dispatcher batch channel.
const BATCH_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Syncing,
    Watching,
    Stopping,
    Completed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Syncing => "syncing",
            SessionState::Watching => "watching",
            SessionState::Stopping => "stopping",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSettings {
    pub enabled: bool,
    pub debounce: Duration,
    /// Run a full sync before watching starts.
    pub initial_sync: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce: DEFAULT_DEBOUNCE,
            initial_sync: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::new(self.max_attempts, self.delay);
        policy.backoff = self.backoff;
        policy
    }
}

/// Everything a session needs, supplied by the caller.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub source_root: PathBuf,
    pub target: TransportTarget,
    pub ignore_patterns: Vec<String>,
    /// Contents of the source root's ignore file, if any.
    pub ignore_file_content: Option<String>,
    pub watch: WatchSettings,
    pub retry: RetrySettings,
    /// Skip files whose destination copy already matches during full syncs.
    pub skip_unchanged: bool,
}

impl SessionConfig {
    pub fn new(source_root: impl Into<PathBuf>, target: TransportTarget) -> Self {
        Self {
            source_root: source_root.into(),
            target,
            ignore_patterns: Vec::new(),
            ignore_file_content: None,
            watch: WatchSettings::default(),
            retry: RetrySettings::default(),
            skip_unchanged: true,
        }
    }
}

/// Outcome of a deploy, a watch session or a single change batch.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub target: String,
    pub state: SessionState,
    pub results: Vec<TransferResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            state: SessionState::Idle,
            results: Vec::new(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            bytes_sent: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn record(&mut self, result: TransferResult) {
        match result.status {
            TransferStatus::Ok => self.succeeded += 1,
            TransferStatus::Failed => self.failed += 1,
            TransferStatus::Skipped => self.skipped += 1,
        }
        self.bytes_sent += result.bytes_sent;
        self.results.push(result);
    }

    pub fn merge(&mut self, other: SyncReport) {
        for result in other.results {
            self.record(result);
        }
    }

    pub fn finish(mut self, state: SessionState, elapsed: Duration) -> Self {
        self.state = state;
        self.elapsed = elapsed;
        self
    }

    /// Completed with no failed file.
    pub fn is_success(&self) -> bool {
        self.state == SessionState::Completed && self.failed == 0
    }

    /// Successful results of the given kind.
    pub fn count_ok(&self, kind: TaskKind) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == TransferStatus::Ok && r.task.kind == kind)
            .count()
    }
}

/// Drives one session against one target.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    /// Canonical form of the source root, for matching watcher paths.
    canonical_root: Option<PathBuf>,
    ignore: IgnoreMatcher,
    adapter: Arc<dyn TransportAdapter>,
    retry: RetryPolicy,
    progress: ProgressTracker,
    status: Arc<dyn StatusSink>,
    locks: FingerprintLocks,
    permits: Semaphore,
    state: Mutex<SessionState>,
    connection_lost: AtomicBool,
    stopping: AtomicBool,
}

impl SyncOrchestrator {
    /// Build a session, choosing the transport from the target's protocol.
    pub fn new(config: SessionConfig, status: Arc<dyn StatusSink>) -> Result<Self> {
        let adapter = create_adapter(&config.target)?;
        Self::with_adapter(config, adapter, status)
    }

    /// Build a session around an existing adapter.
    ///
    /// Fails with [`SyncError::IgnoreRule`] before anything is transferred
    /// when a pattern does not compile.
    pub fn with_adapter(
        config: SessionConfig,
        adapter: Arc<dyn TransportAdapter>,
        status: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        let ignore = IgnoreMatcher::load(config.ignore_file_content.as_deref(), &config.ignore_patterns)?;
        let limit = config.target.concurrency_limit.max(1);
        let progress = ProgressTracker::new(config.target.name.clone(), Arc::clone(&status));
        let canonical_root = std::fs::canonicalize(&config.source_root).ok();
        let retry = config.retry.policy();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                canonical_root,
                ignore,
                adapter,
                retry,
                progress,
                status,
                locks: FingerprintLocks::new(),
                permits: Semaphore::new(limit),
                state: Mutex::new(SessionState::Idle),
                connection_lost: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn ignore(&self) -> &IgnoreMatcher {
        &self.inner.ignore
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.inner.progress
    }

    fn target_name(&self) -> &str {
        &self.inner.config.target.name
    }

    /// Connect under the retry policy. Authentication failures are not retried.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(SessionState::Connecting);
        self.inner.connection_lost.store(false, Ordering::Release);

        let adapter = &self.inner.adapter;
        let outcome = self.inner.retry.execute("connect", move || adapter.connect()).await;
        match outcome.result {
            Ok(()) => {
                info!(
                    host = self.target_name(),
                    endpoint = %adapter.describe(),
                    attempts = outcome.attempts,
                    "connected"
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(SessionState::Failed);
                Err(err)
            }
        }
    }

    /// Close the connection. Errors are logged, never returned.
    pub async fn disconnect(&self) {
        if let Err(err) = self.inner.adapter.disconnect().await {
            warn!(host = self.target_name(), "disconnect failed: {}", err);
        }
    }

    /// Walk the source tree and build one upload task per file that survives
    /// the ignore rules. Ignored directories are not descended into.
    pub async fn scan(&self) -> Result<Vec<TransferTask>> {
        let root = self.inner.config.source_root.clone();
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(SyncError::PathNotFound { path: root }),
        }

        let ignore = self.inner.ignore.clone();
        let target = self.inner.config.target.clone();
        tokio::task::spawn_blocking(move || walk_source(&root, &ignore, &target))
            .await
            .map_err(|e| SyncError::io("walking source tree", std::io::Error::other(e)))
    }

    /// Mirror the whole source tree. The adapter must be connected.
    pub async fn full_sync(&self) -> Result<SyncReport> {
        let started = Instant::now();
        self.set_state(SessionState::Syncing);

        let tasks = match self.scan().await {
            Ok(tasks) => tasks,
            Err(err) => {
                self.set_state(SessionState::Failed);
                return Err(err);
            }
        };
        info!(host = self.target_name(), files = tasks.len(), "full sync");

        let mut report = SyncReport::new(self.target_name());
        for result in self.dispatch(tasks, true).await {
            report.record(result);
        }

        let state = self.outcome_state();
        self.set_state(state);
        Ok(report.finish(state, started.elapsed()))
    }

    /// Connect, mirror the source tree once, disconnect.
    pub async fn deploy(&self) -> Result<SyncReport> {
        if let Err(err) = self.connect().await {
            self.disconnect().await;
            return Err(err);
        }
        let report = self.full_sync().await;
        self.disconnect().await;
        self.set_state(SessionState::Idle);
        report
    }

    /// Apply one batch of settled changes. The adapter must be connected.
    pub async fn apply_changes(&self, events: Vec<ChangeEvent>) -> SyncReport {
        let started = Instant::now();
        self.set_state(SessionState::Syncing);

        let mut report = SyncReport::new(self.target_name());
        for result in self.apply_batch(events).await {
            report.record(result);
        }

        let state = self.outcome_state();
        self.set_state(state);
        report.finish(state, started.elapsed())
    }

    /// Run a watch session until `shutdown` resolves or the connection is
    /// lost.
    ///
    /// On shutdown the watcher is stopped first, pending and queued changes
    /// are discarded, transfers already running finish, and only then is the
    /// connection closed.
    pub async fn watch<F>(&self, shutdown: F) -> Result<SyncReport>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        if let Err(err) = self.connect().await {
            self.disconnect().await;
            return Err(err);
        }

        let mut report = SyncReport::new(self.target_name());
        if self.inner.config.watch.initial_sync {
            match self.full_sync().await {
                Ok(initial) => report.merge(initial),
                Err(err) => {
                    self.disconnect().await;
                    return Err(err);
                }
            }
            if self.inner.connection_lost.load(Ordering::Acquire) {
                self.disconnect().await;
                return Ok(report.finish(SessionState::Failed, started.elapsed()));
            }
        }

        let root = self.inner.config.source_root.clone();
        let (mut watcher, raw_rx) = match ChangeWatcher::start(&root, DEFAULT_CHANNEL_CAPACITY) {
            Ok(pair) => pair,
            Err(err) => {
                self.set_state(SessionState::Failed);
                self.disconnect().await;
                return Err(err);
            }
        };

        let (control_tx, control_rx) = mpsc::channel(4);
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let coalescer = tokio::spawn(
            ChangeCoalescer::new(self.inner.config.watch.debounce).run(raw_rx, control_rx, batch_tx),
        );

        self.inner.stopping.store(false, Ordering::Release);
        self.set_state(SessionState::Watching);
        info!(
            host = self.target_name(),
            root = %root.display(),
            "watching for changes"
        );

        let mut dispatcher = tokio::spawn(self.clone().dispatch_batches(batch_rx));
        tokio::pin!(shutdown);
        let finished_early = tokio::select! {
            _ = &mut shutdown => None,
            joined = &mut dispatcher => Some(joined),
        };

        self.set_state(SessionState::Stopping);
        // Set before the watcher goes away: closing the raw stream makes the
        // coalescer flush, and that batch must be discarded too.
        self.inner.stopping.store(true, Ordering::Release);
        watcher.stop();
        let _ = control_tx.send(CoalescerCommand::Stop).await;

        let joined = match finished_early {
            Some(joined) => joined,
            None => dispatcher.await,
        };
        match joined {
            Ok(batches) => report.merge(batches),
            Err(err) => warn!(host = self.target_name(), "dispatcher task failed: {}", err),
        }
        if let Err(err) = coalescer.await {
            warn!(host = self.target_name(), "coalescer task failed: {}", err);
        }

        self.disconnect().await;
        let state = self.outcome_state();
        self.set_state(state);
        self.set_state(SessionState::Idle);
        info!(host = self.target_name(), "watch session ended");
        Ok(report.finish(state, started.elapsed()))
    }

    /// [`watch`](Self::watch) taking the session by value, for spawning.
    pub async fn watch_owned<F>(self, shutdown: F) -> Result<SyncReport>
    where
        F: Future<Output = ()>,
    {
        self.watch(shutdown).await
    }

    /// Process batches one after another so changes to the same path are
    /// applied in the order they settled.
    async fn dispatch_batches(self, mut batches: mpsc::Receiver<Vec<ChangeEvent>>) -> SyncReport {
        let mut report = SyncReport::new(self.target_name());
        while let Some(batch) = batches.recv().await {
            if self.inner.stopping.load(Ordering::Acquire) {
                debug!(dropped = batch.len(), "discarding changes after stop");
                continue;
            }

            self.transition(SessionState::Watching, SessionState::Syncing);
            for result in self.apply_batch(batch).await {
                report.record(result);
            }
            if self.inner.connection_lost.load(Ordering::Acquire) {
                warn!(host = self.target_name(), "connection lost, ending watch session");
                break;
            }
            self.transition(SessionState::Syncing, SessionState::Watching);
        }
        report
    }

    async fn apply_batch(&self, events: Vec<ChangeEvent>) -> Vec<TransferResult> {
        let tasks = self.plan_changes(events).await;
        if tasks.is_empty() {
            return Vec::new();
        }

        let results = self.dispatch(tasks, false).await;
        for result in &results {
            if result.status == TransferStatus::Ok && result.task.kind == TaskKind::Remove {
                self.prune_empty_parents(&result.task.relative_path).await;
            }
        }
        results
    }

    /// Turn change events into tasks, dropping ignored paths and files that
    /// vanished before they could be uploaded.
    async fn plan_changes(&self, events: Vec<ChangeEvent>) -> Vec<TransferTask> {
        let config = &self.inner.config;
        let mut tasks = Vec::with_capacity(events.len());
        for event in events {
            let Some(relative) = self.relative_to_source(&event.path) else {
                debug!(path = %event.path.display(), "change outside source root");
                continue;
            };
            if self.inner.ignore.is_path_ignored(Path::new(&relative)) {
                debug!(path = relative.as_str(), "ignored change");
                continue;
            }

            match event.kind {
                ChangeKind::Created | ChangeKind::Modified => {
                    match tokio::fs::metadata(&event.path).await {
                        Ok(meta) if meta.is_file() => tasks.push(TransferTask::upload(
                            &config.source_root,
                            &relative,
                            &config.target,
                            meta.len(),
                        )),
                        Ok(_) => {}
                        Err(_) => debug!(path = relative.as_str(), "changed file no longer exists"),
                    }
                }
                ChangeKind::Deleted => tasks.push(TransferTask::remove(
                    &config.source_root,
                    &relative,
                    &config.target,
                )),
            }
        }
        tasks
    }

    fn relative_to_source(&self, path: &Path) -> Option<String> {
        relative_slash_path(&self.inner.config.source_root, path).or_else(|| {
            self.inner
                .canonical_root
                .as_deref()
                .and_then(|root| relative_slash_path(root, path))
        })
    }

    /// Run tasks concurrently up to the target's limit.
    async fn dispatch(&self, tasks: Vec<TransferTask>, check_remote: bool) -> Vec<TransferResult> {
        let total_bytes = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::Upload)
            .map(|t| t.size_hint)
            .sum();
        self.inner.progress.start_transfer(total_bytes, tasks.len() as u64);

        let limit = self.inner.config.target.concurrency_limit.max(1);
        let results = stream::iter(tasks)
            .map(|task| self.run_task(task, check_remote))
            .buffer_unordered(limit)
            .collect::<Vec<_>>()
            .await;

        self.inner.progress.complete();
        results
    }

    async fn run_task(&self, task: TransferTask, check_remote: bool) -> TransferResult {
        let inner = &self.inner;
        let _guard = inner.locks.acquire(task.fingerprint(self.target_name())).await;

        let result = if inner.connection_lost.load(Ordering::Acquire) {
            TransferResult::skipped(task, "connection lost")
        } else {
            match inner.permits.acquire().await {
                Ok(_permit) => match task.kind {
                    TaskKind::Upload => self.upload(task, check_remote).await,
                    TaskKind::Remove => self.remove(task).await,
                },
                Err(_) => TransferResult::skipped(task, "session closed"),
            }
        };

        inner.progress.file_done();
        inner.status.on_result(self.target_name(), &result);
        result
    }

    async fn upload(&self, task: TransferTask, check_remote: bool) -> TransferResult {
        let inner = &self.inner;
        let source = match tokio::fs::metadata(&task.source_path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return TransferResult::skipped(task, "source missing"),
        };
        if check_remote && inner.config.skip_unchanged && self.is_up_to_date(&task, &source).await {
            return TransferResult::skipped(task, "up to date");
        }

        let adapter = &inner.adapter;
        let (source_path, dest_path) = (&task.source_path, &task.dest_path);
        let outcome = inner
            .retry
            .execute(&format!("upload {}", task.relative_path), move || {
                adapter.put(source_path, dest_path)
            })
            .await;

        match outcome.result {
            Ok(bytes) => {
                inner.progress.update(bytes, &task.relative_path);
                TransferResult::ok(task, outcome.attempts, bytes)
            }
            Err(SyncError::PathNotFound { .. }) => TransferResult::skipped(task, "source vanished"),
            Err(err) => {
                self.note_failure(&err);
                TransferResult::failed(task, outcome.attempts, err)
            }
        }
    }

    async fn remove(&self, task: TransferTask) -> TransferResult {
        let adapter = &self.inner.adapter;
        let dest_path = task.dest_path.as_str();
        let outcome = self
            .inner
            .retry
            .execute(&format!("remove {}", task.relative_path), move || {
                adapter.remove(dest_path)
            })
            .await;

        match outcome.result {
            Ok(()) => TransferResult::ok(task, outcome.attempts, 0),
            Err(err) => {
                self.note_failure(&err);
                TransferResult::failed(task, outcome.attempts, err)
            }
        }
    }

    async fn is_up_to_date(&self, task: &TransferTask, source: &std::fs::Metadata) -> bool {
        match self.inner.adapter.stat(&task.dest_path).await {
            Ok(Some(remote)) => is_unchanged(source, &remote),
            Ok(None) => false,
            Err(err) => {
                debug!(path = task.relative_path.as_str(), "stat failed, uploading: {}", err);
                false
            }
        }
    }

    /// Remove destination directories left empty by a deletion, walking up
    /// from the file's parent. The destination root itself is never removed.
    async fn prune_empty_parents(&self, relative_path: &str) {
        let target = &self.inner.config.target;
        let mut current = relative_path;
        while let Some(idx) = current.rfind('/') {
            let parent = &current[..idx];
            match self.inner.adapter.remove_dir_if_empty(&target.dest_path(parent)).await {
                Ok(true) => debug!(path = parent, "removed empty directory"),
                Ok(false) => break,
                Err(err) => {
                    debug!(path = parent, "could not prune directory: {}", err);
                    break;
                }
            }
            current = parent;
        }
    }

    fn note_failure(&self, err: &SyncError) {
        if err.is_connection_loss() && !self.inner.connection_lost.swap(true, Ordering::AcqRel) {
            warn!(host = self.target_name(), "connection lost: {}", err);
        }
    }

    fn outcome_state(&self) -> SessionState {
        if self.inner.connection_lost.load(Ordering::Acquire) {
            SessionState::Failed
        } else {
            SessionState::Completed
        }
    }

    fn set_state(&self, state: SessionState) {
        {
            let mut current = self.lock_state();
            if *current == state {
                return;
            }
            *current = state;
        }
        self.inner.status.on_state(self.target_name(), state);
    }

    /// Move to `to` only if the session is still in `from`.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        {
            let mut current = self.lock_state();
            if *current != from {
                return false;
            }
            *current = to;
        }
        self.inner.status.on_state(self.target_name(), to);
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Same size and a destination copy at least as new as the source, compared
/// in whole seconds.
fn is_unchanged(source: &std::fs::Metadata, remote: &RemoteStat) -> bool {
    if source.len() != remote.size {
        return false;
    }
    let (Some(remote_modified), Ok(local_modified)) = (remote.modified, source.modified()) else {
        return false;
    };
    let local_modified: DateTime<Utc> = local_modified.into();
    remote_modified.timestamp() >= local_modified.timestamp()
}

fn walk_source(root: &Path, ignore: &IgnoreMatcher, target: &TransportTarget) -> Vec<TransferTask> {
    let filter_root = root.to_path_buf();
    let filter = ignore.clone();

    let walker = WalkDir::new(root)
        .skip_hidden(false)
        .follow_links(false)
        .sort(true)
        .process_read_dir(move |_depth, _dir, _state, children| {
            children.retain(|entry| match entry {
                Ok(entry) => match relative_slash_path(&filter_root, &entry.path()) {
                    Some(relative) => !filter.should_ignore(&relative, entry.file_type().is_dir()),
                    None => true,
                },
                Err(_) => true,
            });
        });

    let mut tasks = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) => {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let Some(relative) = relative_slash_path(root, &path) else {
                    continue;
                };
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                tasks.push(TransferTask::upload(root, &relative, target, size));
            }
            Err(e) => warn!("error walking {}: {}", root.display(), e),
        }
    }
    tasks
}
