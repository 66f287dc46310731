//! Transfer tasks, their results and the per-destination lock registry.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::fs::TransportTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Upload,
    Remove,
}

/// One unit of work against the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub source_path: PathBuf,
    /// Path under the source root, `/`-separated.
    pub relative_path: String,
    pub dest_path: String,
    pub size_hint: u64,
    pub kind: TaskKind,
}

impl TransferTask {
    pub fn upload(source_root: &Path, relative_path: &str, target: &TransportTarget, size: u64) -> Self {
        Self {
            source_path: source_root.join(relative_path),
            relative_path: relative_path.to_string(),
            dest_path: target.dest_path(relative_path),
            size_hint: size,
            kind: TaskKind::Upload,
        }
    }

    pub fn remove(source_root: &Path, relative_path: &str, target: &TransportTarget) -> Self {
        Self {
            source_path: source_root.join(relative_path),
            relative_path: relative_path.to_string(),
            dest_path: target.dest_path(relative_path),
            size_hint: 0,
            kind: TaskKind::Remove,
        }
    }

    pub fn fingerprint(&self, target: &str) -> Fingerprint {
        Fingerprint {
            target: target.to_string(),
            relative_path: self.relative_path.clone(),
        }
    }
}

/// `(target, relative path)`: identifies a destination file within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub target: String,
    pub relative_path: String,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target, self.relative_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct TransferResult {
    pub task: TransferTask,
    pub status: TransferStatus,
    pub attempts: u32,
    pub bytes_sent: u64,
    pub error: Option<String>,
    /// Why a task was skipped.
    pub reason: Option<String>,
}

impl TransferResult {
    pub fn ok(task: TransferTask, attempts: u32, bytes_sent: u64) -> Self {
        Self {
            task,
            status: TransferStatus::Ok,
            attempts,
            bytes_sent,
            error: None,
            reason: None,
        }
    }

    pub fn failed(task: TransferTask, attempts: u32, error: impl ToString) -> Self {
        Self {
            task,
            status: TransferStatus::Failed,
            attempts,
            bytes_sent: 0,
            error: Some(error.to_string()),
            reason: None,
        }
    }

    pub fn skipped(task: TransferTask, reason: impl Into<String>) -> Self {
        Self {
            task,
            status: TransferStatus::Skipped,
            attempts: 0,
            bytes_sent: 0,
            error: None,
            reason: Some(reason.into()),
        }
    }
}

type LockMap = HashMap<Fingerprint, Arc<AsyncMutex<()>>>;

/// Registry of per-fingerprint locks. Entries exist only while some task
/// holds or waits for them.
#[derive(Debug, Clone, Default)]
pub struct FingerprintLocks {
    map: Arc<Mutex<LockMap>>,
}

impl FingerprintLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other task holds `fingerprint`, then hold it until the
    /// returned guard is dropped.
    pub async fn acquire(&self, fingerprint: Fingerprint) -> FingerprintGuard {
        let entry = {
            let mut map = lock_map(&self.map);
            map.entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = entry.clone().lock_owned().await;
        FingerprintGuard {
            fingerprint,
            entry,
            guard: Some(guard),
            map: Arc::clone(&self.map),
        }
    }

    /// Number of fingerprints currently held or awaited.
    pub fn len(&self) -> usize {
        lock_map(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct FingerprintGuard {
    fingerprint: Fingerprint,
    entry: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<Mutex<LockMap>>,
}

impl FingerprintGuard {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Drop for FingerprintGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = lock_map(&self.map);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.entry) == 2 {
            map.remove(&self.fingerprint);
        }
    }
}

fn lock_map(map: &Mutex<LockMap>) -> std::sync::MutexGuard<'_, LockMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fp(path: &str) -> Fingerprint {
        Fingerprint {
            target: "prod".to_string(),
            relative_path: path.to_string(),
        }
    }

    #[test]
    fn test_task_paths() {
        let target = TransportTarget::local("prod", "/srv/www");
        let task = TransferTask::upload(Path::new("/home/me/site"), "css/app.css", &target, 12);
        assert_eq!(task.source_path, PathBuf::from("/home/me/site/css/app.css"));
        assert_eq!(task.dest_path, "/srv/www/css/app.css");
        assert_eq!(task.fingerprint("prod"), fp("css/app.css"));

        let remove = TransferTask::remove(Path::new("/home/me/site"), "css/app.css", &target);
        assert_eq!(remove.kind, TaskKind::Remove);
        assert_eq!(remove.fingerprint("prod"), task.fingerprint("prod"));
    }

    #[tokio::test]
    async fn test_same_fingerprint_is_serialized() {
        let locks = FingerprintLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(fp("a.txt")).await;
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(overlap.load(Ordering::SeqCst), 0);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_do_not_block() {
        let locks = FingerprintLocks::new();
        let first = locks.acquire(fp("a.txt")).await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.acquire(fp("b.txt")))
            .await
            .expect("different paths must not wait on each other");
        assert_eq!(locks.len(), 2);
        assert_eq!(second.fingerprint(), &fp("b.txt"));
        drop(first);
        drop(second);
        assert!(locks.is_empty());
    }
}
