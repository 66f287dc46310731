// Shared fixtures: an in-memory transport that counts calls and records
// overlapping writes to the same destination.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use driftsync::fs::backend::ancestors_inclusive;
use driftsync::fs::{Protocol, RemoteStat, TransportAdapter, TransportTarget};
use driftsync::sync::{
    Backoff, NullStatus, RetrySettings, SessionConfig, StatusSink, SyncOrchestrator,
};
use driftsync::{Result, SyncError};

pub const DEST_ROOT: &str = "/remote/www";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Every put fails with a retryable transfer error.
    Transient,
    /// Every put fails because the connection dropped.
    ConnectionLost,
    /// Connect is refused with bad credentials.
    Auth,
}

#[derive(Default)]
pub struct MemoryTransport {
    files: Mutex<HashMap<String, (Vec<u8>, Option<DateTime<Utc>>)>>,
    dirs: Mutex<BTreeSet<String>>,
    active: Mutex<HashMap<String, usize>>,
    failure: Mutex<Option<Failure>>,
    put_delay: Mutex<Duration>,

    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub puts: AtomicUsize,
    pub removes: AtomicUsize,
    pub overlaps: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    put_log: Mutex<Vec<String>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, failure: Failure) {
        *self.failure.lock().unwrap() = Some(failure);
    }

    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = delay;
    }

    pub fn file(&self, dest: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(dest).map(|(data, _)| data.clone())
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.files.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }

    /// Destinations passed to `put`, in call order.
    pub fn put_log(&self) -> Vec<String> {
        self.put_log.lock().unwrap().clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn failure(&self) -> Option<Failure> {
        *self.failure.lock().unwrap()
    }

    fn add_parents(&self, dest: &str) {
        let mut dirs = self.dirs.lock().unwrap();
        if let Some(idx) = dest.rfind('/') {
            for dir in ancestors_inclusive(&dest[..idx]) {
                dirs.insert(dir);
            }
        }
    }
}

#[async_trait]
impl TransportAdapter for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.failure() == Some(Failure::Auth) {
            return Err(SyncError::Authentication {
                target: "memory".into(),
                message: "permission denied".into(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        let mut dirs = self.dirs.lock().unwrap();
        for dir in ancestors_inclusive(path) {
            dirs.insert(dir);
        }
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>> {
        Ok(self.files.lock().unwrap().get(path).map(|(data, modified)| RemoteStat {
            size: data.len() as u64,
            modified: *modified,
        }))
    }

    async fn put(&self, local: &Path, dest: &str) -> Result<u64> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.put_log.lock().unwrap().push(dest.to_string());

        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(dest.to_string()).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.put_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = match self.failure() {
            Some(Failure::Transient) => Err(SyncError::transfer(dest, "connection timed out")),
            Some(Failure::ConnectionLost) => Err(SyncError::connection("memory", "broken pipe")),
            _ => match tokio::fs::read(local).await {
                Ok(data) => {
                    let modified = std::fs::metadata(local)
                        .and_then(|m| m.modified())
                        .ok()
                        .map(DateTime::<Utc>::from);
                    let len = data.len() as u64;
                    self.add_parents(dest);
                    self.files
                        .lock()
                        .unwrap()
                        .insert(dest.to_string(), (data, modified));
                    Ok(len)
                }
                Err(_) => Err(SyncError::PathNotFound {
                    path: local.to_path_buf(),
                }),
            },
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        *self.active.lock().unwrap().get_mut(dest).unwrap() -= 1;
        result
    }

    async fn remove(&self, dest: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().remove(dest);
        Ok(())
    }

    async fn remove_dir_if_empty(&self, path: &str) -> Result<bool> {
        let prefix = format!("{}/", path);
        let occupied = self.files.lock().unwrap().keys().any(|k| k.starts_with(&prefix))
            || self
                .dirs
                .lock()
                .unwrap()
                .iter()
                .any(|d| d.starts_with(&prefix));
        if occupied {
            return Ok(false);
        }
        Ok(self.dirs.lock().unwrap().remove(path))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ftp
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Session config for `source` with fast retries and the given patterns.
pub fn session_config(source: &Path, dest_root: &str, patterns: &[&str]) -> SessionConfig {
    let mut target = TransportTarget::local("memory", dest_root);
    target.concurrency_limit = 4;
    let mut config = SessionConfig::new(source, target);
    config.ignore_patterns = patterns.iter().map(|p| p.to_string()).collect();
    config.retry = RetrySettings {
        max_attempts: 3,
        delay: Duration::from_millis(1),
        backoff: Backoff::Fixed,
    };
    config.watch.debounce = Duration::from_millis(100);
    config
}

pub fn memory_session(config: SessionConfig, transport: &Arc<MemoryTransport>) -> SyncOrchestrator {
    let adapter: Arc<dyn TransportAdapter> = transport.clone();
    let status: Arc<dyn StatusSink> = Arc::new(NullStatus);
    SyncOrchestrator::with_adapter(config, adapter, status).unwrap()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
