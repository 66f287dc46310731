//! FTP transport over a single control connection.

use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::fs::backend::{
    remote_parent, temp_sibling, Credentials, DirCache, Protocol, RemoteStat, TransportAdapter,
    TransportTarget,
};

pub struct FtpTransport {
    target: TransportTarget,
    address: String,
    credentials: Credentials,
    conn: Arc<Mutex<Option<FtpStream>>>,
    handshake: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    dirs: DirCache,
}

/// Reply code carried by an FTP error, if any.
fn reply_code(err: &FtpError) -> Option<u32> {
    match err {
        FtpError::UnexpectedResponse(response) => Some(response.status.code()),
        _ => None,
    }
}

fn is_missing(err: &FtpError) -> bool {
    matches!(reply_code(err), Some(450) | Some(550))
}

/// Map an FTP failure for an operation on `path`.
fn map_ftp_error(target: &str, path: &str, err: FtpError) -> SyncError {
    match reply_code(&err) {
        Some(421) | Some(425) | Some(426) | None => {
            SyncError::connection(target, format!("{}: {}", path, err))
        }
        Some(530) => SyncError::Authentication {
            target: target.to_string(),
            message: err.to_string(),
        },
        Some(code) if (400..500).contains(&code) => SyncError::transfer(path, err),
        Some(_) => SyncError::InvalidDestination {
            path: path.to_string(),
            reason: err.to_string(),
        },
    }
}

fn open_stream(
    target: &str,
    address: &str,
    credentials: &Credentials,
    timeout: std::time::Duration,
) -> Result<FtpStream> {
    let socket_addr = address
        .to_socket_addrs()
        .map_err(|e| SyncError::connection(target, format!("resolving {}: {}", address, e)))?
        .next()
        .ok_or_else(|| SyncError::connection(target, format!("no address for {}", address)))?;

    let mut ftp = FtpStream::connect_timeout(socket_addr, timeout)
        .map_err(|e| SyncError::connection(target, format!("connecting to {}: {}", address, e)))?;
    if let Err(e) = ftp.get_ref().set_read_timeout(Some(timeout)) {
        warn!("ftp: could not set read timeout: {}", e);
    }

    let password = credentials.password.as_deref().unwrap_or_default();
    ftp.login(credentials.user.as_str(), password)
        .map_err(|e| SyncError::Authentication {
            target: target.to_string(),
            message: e.to_string(),
        })?;
    ftp.transfer_type(FileType::Binary)
        .map_err(|e| map_ftp_error(target, "/", e))?;
    Ok(ftp)
}

fn mkdir_tolerant(ftp: &mut FtpStream, target: &str, dir: &str) -> Result<()> {
    match ftp.mkdir(dir) {
        Ok(()) => Ok(()),
        Err(err) => {
            // Already exists if we can change into it.
            let here = ftp.pwd().map_err(|e| map_ftp_error(target, dir, e))?;
            if ftp.cwd(dir).is_ok() {
                ftp.cwd(&here).map_err(|e| map_ftp_error(target, &here, e))?;
                Ok(())
            } else {
                Err(map_ftp_error(target, dir, err))
            }
        }
    }
}

fn upload(ftp: &mut FtpStream, target: &str, local: &Path, dest: &str) -> Result<u64> {
    let mut input = File::open(local).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SyncError::PathNotFound {
            path: local.to_path_buf(),
        },
        _ => SyncError::io(format!("opening {}", local.display()), e),
    })?;

    let tmp = temp_sibling(dest);
    let bytes = match ftp.put_file(tmp.as_str(), &mut input) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = ftp.rm(tmp.as_str());
            return Err(map_ftp_error(target, dest, err));
        }
    };

    if ftp.rename(tmp.as_str(), dest).is_err() {
        // Many servers refuse to rename over an existing file.
        let _ = ftp.rm(dest);
        if let Err(err) = ftp.rename(tmp.as_str(), dest) {
            let _ = ftp.rm(tmp.as_str());
            return Err(map_ftp_error(target, dest, err));
        }
    }
    Ok(bytes)
}

impl FtpTransport {
    pub fn new(target: TransportTarget) -> Result<Self> {
        let address = target.address()?;
        let credentials = target.credentials()?.clone();
        Ok(Self {
            target,
            address,
            credentials,
            conn: Arc::new(Mutex::new(None)),
            handshake: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            dirs: DirCache::new(),
        })
    }

    fn is_connected(&self) -> bool {
        self.conn.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    async fn with_ftp<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::connection(&self.target.name, "session closed"));
        }
        if !self.is_connected() {
            self.connect().await?;
        }

        let conn = Arc::clone(&self.conn);
        let name = self.target.name.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| SyncError::connection(&name, "connection lock poisoned"))?;
            let ftp = guard
                .as_mut()
                .ok_or_else(|| SyncError::connection(&name, "not connected"))?;
            f(ftp)
        })
        .await
        .map_err(|e| SyncError::connection(&self.target.name, e))?;

        if let Err(err) = &result {
            if err.is_connection_loss() {
                if let Ok(mut guard) = self.conn.lock() {
                    guard.take();
                }
            }
        }
        result
    }
}

#[async_trait]
impl TransportAdapter for FtpTransport {
    async fn connect(&self) -> Result<()> {
        let _handshake = self.handshake.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.closed.store(false, Ordering::SeqCst);

        let name = self.target.name.clone();
        let address = self.address.clone();
        let credentials = self.credentials.clone();
        let timeout = self.target.timeout;
        let stream = tokio::task::spawn_blocking(move || {
            open_stream(&name, &address, &credentials, timeout)
        })
        .await
        .map_err(|e| SyncError::connection(&self.target.name, e))??;

        let mut guard = self
            .conn
            .lock()
            .map_err(|_| SyncError::connection(&self.target.name, "connection lock poisoned"))?;
        *guard = Some(stream);
        info!(target_name = %self.target.name, "connected to {} via FTP", self.address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let stream = match self.conn.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        self.dirs.clear().await;
        if let Some(mut ftp) = stream {
            tokio::task::spawn_blocking(move || {
                if let Err(e) = ftp.quit() {
                    warn!("ftp quit: {}", e);
                }
            })
            .await
            .map_err(|e| SyncError::connection(&self.target.name, e))?;
            info!(target_name = %self.target.name, "disconnected from {}", self.address);
        }
        Ok(())
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        self.dirs
            .ensure(path, |dir| {
                let name = self.target.name.clone();
                self.with_ftp(move |ftp| mkdir_tolerant(ftp, &name, &dir))
            })
            .await
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>> {
        let name = self.target.name.clone();
        let path = path.to_string();
        self.with_ftp(move |ftp| {
            let size = match ftp.size(path.as_str()) {
                Ok(size) => size as u64,
                Err(e) if is_missing(&e) => return Ok(None),
                Err(e) => return Err(map_ftp_error(&name, &path, e)),
            };
            // MDTM is optional on many servers.
            let modified = ftp.mdtm(path.as_str()).ok().map(|t| t.and_utc());
            Ok(Some(RemoteStat { size, modified }))
        })
        .await
    }

    async fn put(&self, local: &Path, dest: &str) -> Result<u64> {
        if let Some(parent) = remote_parent(dest) {
            self.ensure_dir(parent).await?;
        }
        let name = self.target.name.clone();
        let local = local.to_path_buf();
        let dest = dest.to_string();
        self.with_ftp(move |ftp| upload(ftp, &name, &local, &dest))
            .await
    }

    async fn remove(&self, dest: &str) -> Result<()> {
        let name = self.target.name.clone();
        let path = dest.to_string();
        let removed_dir = self
            .with_ftp(move |ftp| match ftp.rm(path.as_str()) {
                Ok(()) => Ok(false),
                Err(e) if is_missing(&e) => match ftp.rmdir(path.as_str()) {
                    Ok(()) => Ok(true),
                    // Neither a file nor an empty directory: treat as gone.
                    Err(e) if is_missing(&e) => Ok(false),
                    Err(e) => Err(map_ftp_error(&name, &path, e)),
                },
                Err(e) => Err(map_ftp_error(&name, &path, e)),
            })
            .await?;
        if removed_dir {
            self.dirs.forget(dest).await;
        }
        Ok(())
    }

    async fn remove_dir_if_empty(&self, path: &str) -> Result<bool> {
        let name = self.target.name.clone();
        let dir = path.to_string();
        let removed = self
            .with_ftp(move |ftp| {
                let entries = match ftp.nlst(Some(dir.as_str())) {
                    Ok(entries) => entries,
                    Err(e) if is_missing(&e) => return Ok(false),
                    Err(e) => return Err(map_ftp_error(&name, &dir, e)),
                };
                let has_entries = entries.iter().any(|entry| {
                    let base = entry.rsplit('/').next().unwrap_or(entry);
                    base != "." && base != ".."
                });
                if has_entries {
                    return Ok(false);
                }
                ftp.rmdir(dir.as_str())
                    .map(|_| true)
                    .map_err(|e| map_ftp_error(&name, &dir, e))
            })
            .await?;
        if removed {
            self.dirs.forget(path).await;
        }
        Ok(removed)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ftp
    }

    fn describe(&self) -> String {
        format!(
            "ftp://{}@{}{}",
            self.credentials.user, self.address, self.target.dest_root
        )
    }
}
