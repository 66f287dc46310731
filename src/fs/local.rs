use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::fs::backend::{Protocol, RemoteStat, TransportAdapter, TransportTarget};

/// Local filesystem transport. Destination paths are plain local paths.
pub struct LocalTransport {
    target: TransportTarget,
}

impl LocalTransport {
    pub fn new(target: TransportTarget) -> Self {
        Self { target }
    }
}

/// Copy `src` over `dest` through a temporary sibling, preserving
/// permissions and modification time. The rename makes the new content
/// visible all at once.
fn copy_atomic(src: &Path, dest: &Path) -> Result<u64> {
    let mut input = fs::File::open(src).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SyncError::PathNotFound {
            path: src.to_path_buf(),
        },
        _ => SyncError::io(format!("opening {}", src.display()), e),
    })?;
    let metadata = input
        .metadata()
        .map_err(|e| SyncError::io(format!("reading metadata of {}", src.display()), e))?;

    let parent = dest.parent().ok_or_else(|| SyncError::InvalidDestination {
        path: dest.display().to_string(),
        reason: "no parent directory".to_string(),
    })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".driftsync-")
        .suffix(".part")
        .tempfile_in(parent)
        .map_err(|e| SyncError::io(format!("creating temp file in {}", parent.display()), e))?;

    let bytes = io::copy(&mut input, tmp.as_file_mut())
        .map_err(|e| SyncError::transfer(dest.display().to_string(), e))?;

    let file = tmp.as_file();
    file.sync_all()
        .map_err(|e| SyncError::transfer(dest.display().to_string(), e))?;
    file.set_permissions(metadata.permissions())
        .map_err(|e| SyncError::io(format!("setting permissions on {}", dest.display()), e))?;
    if let Ok(modified) = metadata.modified() {
        file.set_modified(modified)
            .map_err(|e| SyncError::io(format!("setting mtime on {}", dest.display()), e))?;
    }

    tmp.persist(dest)
        .map_err(|e| SyncError::io(format!("renaming into {}", dest.display()), e.error))?;

    Ok(bytes)
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

async fn blocking<T, F>(what: String, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::transfer(what, e))?
}

#[async_trait]
impl TransportAdapter for LocalTransport {
    async fn connect(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.target.dest_root)
            .await
            .map_err(|e| SyncError::InvalidDestination {
                path: self.target.dest_root.clone(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| SyncError::io(format!("creating directory {}", path), e))
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(RemoteStat {
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io(format!("stat {}", path), e)),
        }
    }

    async fn put(&self, local: &Path, dest: &str) -> Result<u64> {
        let dest_path = PathBuf::from(dest);
        if let Some(parent) = dest_path.parent() {
            self.ensure_dir(&parent.to_string_lossy()).await?;
        }
        let local = local.to_path_buf();
        blocking(dest.to_string(), move || copy_atomic(&local, &dest_path)).await
    }

    async fn remove(&self, dest: &str) -> Result<()> {
        let path = PathBuf::from(dest);
        let result = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io(format!("deleting {}", dest), e)),
        }
    }

    async fn remove_dir_if_empty(&self, path: &str) -> Result<bool> {
        let dir = PathBuf::from(path);
        blocking(path.to_string(), move || match is_empty_dir(&dir) {
            Ok(true) => fs::remove_dir(&dir)
                .map(|_| true)
                .map_err(|e| SyncError::io(format!("removing directory {}", dir.display()), e)),
            Ok(false) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::io(format!("reading directory {}", dir.display()), e)),
        })
        .await
    }

    fn protocol(&self) -> Protocol {
        Protocol::Local
    }

    fn describe(&self) -> String {
        format!("local:{}", self.target.dest_root)
    }
}
