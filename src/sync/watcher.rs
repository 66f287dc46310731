//! File system watcher for watch sessions.
//!
//! The OS notification source lives on a dedicated thread. File-level events
//! cross into the async side through a bounded tokio channel, which is the
//! only link between the two.

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use jwalk::WalkDir;
use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// Default capacity of the watcher to coalescer channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Kind of change observed on a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// One OS-level notification for a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Translate a notify event into file-level raw events. Directory events
/// are dropped here, at the source, except that a directory appearing under
/// a new name (rename, move-in, recursive copy) is expanded into `Created`
/// events for the files already inside it.
pub fn translate(event: &Event) -> Vec<RawEvent> {
    let file_events = |kind: ChangeKind| -> Vec<RawEvent> {
        event
            .paths
            .iter()
            .filter(|p| kind == ChangeKind::Deleted || !p.is_dir())
            .map(|p| RawEvent::new(p.clone(), kind))
            .collect()
    };
    let appeared = || -> Vec<RawEvent> { event.paths.iter().flat_map(|p| created_at(p)).collect() };

    match &event.kind {
        EventKind::Create(_) => appeared(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => file_events(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => appeared(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push(RawEvent::new(from.clone(), ChangeKind::Deleted));
            }
            out.extend(event.paths.iter().skip(1).take(1).flat_map(|p| created_at(p)));
            out
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .flat_map(|p| {
                if p.exists() {
                    created_at(p)
                } else {
                    vec![RawEvent::new(p.clone(), ChangeKind::Deleted)]
                }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => file_events(ChangeKind::Modified),
        EventKind::Remove(RemoveKind::Folder) => Vec::new(),
        EventKind::Remove(_) => file_events(ChangeKind::Deleted),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// `Created` for a new file, or for every file below a new directory.
fn created_at(path: &Path) -> Vec<RawEvent> {
    if !path.is_dir() {
        return vec![RawEvent::new(path, ChangeKind::Created)];
    }
    WalkDir::new(path)
        .skip_hidden(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| RawEvent::new(entry.path(), ChangeKind::Created))
        .collect()
}

/// Watches a directory tree on a background thread.
pub struct ChangeWatcher {
    root: PathBuf,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Start watching `root` recursively. Returns the watcher handle and the
    /// receiving end of the event stream.
    pub fn start(root: &Path, capacity: usize) -> Result<(Self, mpsc::Receiver<RawEvent>)> {
        let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
        let (notify_tx, notify_rx) = unbounded::<notify::Result<Event>>();
        let (stop_tx, stop_rx) = unbounded::<()>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = notify_tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )
        .map_err(|e| SyncError::Config(format!("cannot create watcher: {}", e)))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::Config(format!("cannot watch {}: {}", root.display(), e)))?;

        let handle = std::thread::Builder::new()
            .name("driftsync-watcher".to_string())
            .spawn(move || run_watcher(watcher, notify_rx, stop_rx, event_tx))
            .map_err(|e| SyncError::io("spawning watcher thread", e))?;

        debug!(root = %root.display(), "watcher started");
        Ok((
            Self {
                root: root.to_path_buf(),
                stop_tx,
                handle: Some(handle),
            },
            event_rx,
        ))
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop the background thread and wait for it to exit. No event is sent
    /// after this returns. Calling it again is a no-op.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop_tx.send(());
            if handle.join().is_err() {
                warn!("watcher thread panicked");
            }
            debug!(root = %self.root.display(), "watcher stopped");
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_watcher(
    watcher: RecommendedWatcher,
    notify_rx: Receiver<notify::Result<Event>>,
    stop_rx: Receiver<()>,
    event_tx: mpsc::Sender<RawEvent>,
) {
    // Keep the OS watcher alive for as long as this thread runs.
    let _watcher = watcher;

    loop {
        select! {
            recv(stop_rx) -> _ => return,
            recv(notify_rx) -> msg => {
                let event = match msg {
                    Ok(Ok(event)) => event,
                    Ok(Err(e)) => {
                        warn!("watch error: {}", e);
                        continue;
                    }
                    Err(_) => return,
                };
                for raw in translate(&event) {
                    if !forward(&event_tx, &stop_rx, raw) {
                        return;
                    }
                }
            }
        }
    }
}

/// Push one event, waiting while the channel is full. Returns false when
/// the thread should exit.
fn forward(event_tx: &mpsc::Sender<RawEvent>, stop_rx: &Receiver<()>, raw: RawEvent) -> bool {
    let mut pending = raw;
    loop {
        match event_tx.try_send(pending) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(back)) => {
                pending = back;
                if stop_rx.recv_timeout(Duration::from_millis(10)).is_ok() {
                    return false;
                }
            }
        }
    }
}
