use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};

/// Transport protocol, chosen once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Local,
    #[serde(alias = "sftp")]
    Ssh,
    Ftp,
}

impl Protocol {
    /// Get a short display name for the protocol
    pub fn short_name(&self) -> &'static str {
        match self {
            Protocol::Local => "local",
            Protocol::Ssh => "ssh",
            Protocol::Ftp => "ftp",
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Protocol::Local => None,
            Protocol::Ssh => Some(22),
            Protocol::Ftp => Some(21),
        }
    }
}

/// Login material for remote targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub key_path: Option<std::path::PathBuf>,
    pub passphrase: Option<String>,
}

/// Where a session mirrors to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTarget {
    /// Host name from the configuration, used in logs and fingerprints.
    pub name: String,
    pub protocol: Protocol,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub credentials: Option<Credentials>,
    /// Destination root. Remote roots use `/` separators.
    pub dest_root: String,
    /// Maximum number of transfers in flight at once.
    pub concurrency_limit: usize,
    pub timeout: std::time::Duration,
}

impl TransportTarget {
    pub fn local(name: impl Into<String>, dest_root: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            protocol: Protocol::Local,
            host: None,
            port: None,
            credentials: None,
            dest_root: dest_root.as_ref().to_string_lossy().into_owned(),
            concurrency_limit: 4,
            timeout: std::time::Duration::from_secs(30),
        }
    }

    /// `host:port`, falling back to the protocol's default port.
    pub fn address(&self) -> Result<String> {
        let host = self.host.as_deref().ok_or_else(|| {
            SyncError::Config(format!("target '{}' has no host", self.name))
        })?;
        let port = self
            .port
            .or_else(|| self.protocol.default_port())
            .ok_or_else(|| SyncError::Config(format!("target '{}' has no port", self.name)))?;
        Ok(format!("{}:{}", host, port))
    }

    pub fn credentials(&self) -> Result<&Credentials> {
        self.credentials.as_ref().ok_or_else(|| {
            SyncError::Config(format!("target '{}' has no credentials", self.name))
        })
    }

    /// Destination path for a source-relative path.
    pub fn dest_path(&self, relative: &str) -> String {
        join_remote(&self.dest_root, relative)
    }
}

/// Destination file metadata used to skip unchanged files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Uniform interface over every deployment backend.
///
/// Implementations hold at most one live connection and take `&self` so a
/// single adapter can be shared by concurrent transfer tasks.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Establish the underlying session.
    async fn connect(&self) -> Result<()>;

    /// Release the session. Safe to call when `connect` never succeeded.
    async fn disconnect(&self) -> Result<()>;

    /// Create a directory and all missing ancestors. Idempotent.
    async fn ensure_dir(&self, path: &str) -> Result<()>;

    async fn file_exists(&self, path: &str) -> Result<bool>;

    /// Metadata of a destination file, `None` when absent.
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>>;

    /// Upload one file, creating parent directories first. Returns the
    /// number of bytes written. A failed put never leaves a truncated file
    /// at `dest`.
    async fn put(&self, local: &Path, dest: &str) -> Result<u64>;

    /// Delete a file. A missing file is not an error.
    async fn remove(&self, dest: &str) -> Result<()>;

    /// Remove a directory only if it has no entries. Returns whether it was
    /// removed.
    async fn remove_dir_if_empty(&self, path: &str) -> Result<bool>;

    fn protocol(&self) -> Protocol;

    /// Human readable endpoint for logs.
    fn describe(&self) -> String;
}

/// Build the adapter for a target. Dispatch happens here, once.
pub fn create_adapter(target: &TransportTarget) -> Result<Arc<dyn TransportAdapter>> {
    let adapter: Arc<dyn TransportAdapter> = match target.protocol {
        Protocol::Local => Arc::new(crate::fs::local::LocalTransport::new(target.clone())),
        Protocol::Ssh => Arc::new(crate::fs::ssh::SshTransport::new(target.clone())?),
        Protocol::Ftp => Arc::new(crate::fs::ftp::FtpTransport::new(target.clone())?),
    };
    Ok(adapter)
}

/// Serializes directory creation on remote backends and remembers which
/// directories already exist, so two tasks racing on the same missing
/// ancestor both succeed.
#[derive(Debug, Default)]
pub struct DirCache {
    known: Mutex<HashSet<String>>,
}

impl DirCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `create` for every missing ancestor of `path` (root first) while
    /// holding the cache lock. `create` must tolerate "already exists".
    pub async fn ensure<F, Fut>(&self, path: &str, mut create: F) -> Result<()>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut known = self.known.lock().await;
        for dir in ancestors_inclusive(path) {
            if known.contains(&dir) {
                continue;
            }
            create(dir.clone()).await?;
            known.insert(dir);
        }
        Ok(())
    }

    /// Forget a directory and everything below it (after removal).
    pub async fn forget(&self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut known = self.known.lock().await;
        known.retain(|p| p != path && !p.starts_with(&prefix));
    }

    pub async fn clear(&self) {
        self.known.lock().await.clear();
    }
}

/// Join a remote root and a relative path with `/`.
pub fn join_remote(root: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return root.to_string();
    }
    if root.is_empty() {
        return relative.to_string();
    }
    format!("{}/{}", root.trim_end_matches('/'), relative)
}

/// Parent of a `/`-separated path, `None` at the top.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// Every directory prefix of `path` including itself, shortest first.
/// `"/a/b"` yields `["/a", "/a/b"]`; the filesystem root is skipped.
pub fn ancestors_inclusive(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut out = Vec::new();
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !current.is_empty() || absolute {
            current.push('/');
        }
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

/// Temporary sibling name used for atomic uploads.
pub fn temp_sibling(dest: &str) -> String {
    let (dir, name) = match dest.rfind('/') {
        Some(idx) => (&dest[..=idx], &dest[idx + 1..]),
        None => ("", dest),
    };
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("{}.{}.{}-{:08x}.part", dir, name, std::process::id(), nonce)
}
