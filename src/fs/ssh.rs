//! SSH/SFTP transport.
//!
//! One authenticated SSH session carries one SFTP channel. libssh2 is
//! blocking, so every operation runs on the blocking pool and takes the
//! connection lock for its duration: tasks may be issued concurrently but
//! the wire traffic over the channel is serialized.

use async_trait::async_trait;
use chrono::DateTime;
use ssh2::{ErrorCode, FileStat, RenameFlags, Session, Sftp};
use std::fs::File;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::fs::backend::{
    remote_parent, temp_sibling, Credentials, DirCache, Protocol, RemoteStat, TransportAdapter,
    TransportTarget,
};

const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_CONNECTION: i32 = 6;
const FX_CONNECTION_LOST: i32 = 7;
const FX_NO_SUCH_PATH: i32 = 10;

struct SshConnection {
    session: Session,
    sftp: Sftp,
}

pub struct SshTransport {
    target: TransportTarget,
    address: String,
    credentials: Credentials,
    conn: Arc<Mutex<Option<SshConnection>>>,
    /// Held while a session is being opened so concurrent callers do not
    /// race two handshakes.
    handshake: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    dirs: DirCache,
}

impl SshTransport {
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

    /// Run `f` against the live SFTP channel on the blocking pool.
    async fn with_sftp<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
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
            let guard = conn
                .lock()
                .map_err(|_| SyncError::connection(&name, "connection lock poisoned"))?;
            let live = guard
                .as_ref()
                .ok_or_else(|| SyncError::connection(&name, "not connected"))?;
            f(&live.sftp)
        })
        .await
        .map_err(|e| SyncError::connection(&self.target.name, e))?;

        if let Err(err) = &result {
            if err.is_connection_loss() {
                // Drop the dead session; the next call reconnects.
                if let Ok(mut guard) = self.conn.lock() {
                    guard.take();
                }
            }
        }
        result
    }
}

fn open_session(
    target: &str,
    address: &str,
    credentials: &Credentials,
    timeout: std::time::Duration,
) -> Result<SshConnection> {
    let socket_addr = address
        .to_socket_addrs()
        .map_err(|e| SyncError::connection(target, format!("resolving {}: {}", address, e)))?
        .next()
        .ok_or_else(|| SyncError::connection(target, format!("no address for {}", address)))?;

    let tcp = TcpStream::connect_timeout(&socket_addr, timeout)
        .map_err(|e| SyncError::connection(target, format!("connecting to {}: {}", address, e)))?;

    let mut session =
        Session::new().map_err(|e| SyncError::connection(target, e.message().to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session
        .handshake()
        .map_err(|e| SyncError::connection(target, format!("handshake: {}", e.message())))?;

    let user = credentials.user.as_str();
    let auth = if let Some(key) = &credentials.key_path {
        session.userauth_pubkey_file(user, None, key, credentials.passphrase.as_deref())
    } else if let Some(password) = &credentials.password {
        session.userauth_password(user, password)
    } else {
        session.userauth_agent(user)
    };
    auth.map_err(|e| SyncError::Authentication {
        target: target.to_string(),
        message: e.message().to_string(),
    })?;
    if !session.authenticated() {
        return Err(SyncError::Authentication {
            target: target.to_string(),
            message: format!("server rejected user '{}'", user),
        });
    }

    let sftp = session
        .sftp()
        .map_err(|e| SyncError::connection(target, format!("opening sftp channel: {}", e.message())))?;

    Ok(SshConnection { session, sftp })
}

/// Map a libssh2 error for an operation on `path`.
fn map_ssh_error(target: &str, path: &str, err: ssh2::Error) -> SyncError {
    match err.code() {
        ErrorCode::SFTP(FX_NO_CONNECTION) | ErrorCode::SFTP(FX_CONNECTION_LOST) => {
            SyncError::connection(target, format!("{}: {}", path, err.message()))
        }
        ErrorCode::SFTP(FX_PERMISSION_DENIED) => SyncError::InvalidDestination {
            path: path.to_string(),
            reason: err.message().to_string(),
        },
        ErrorCode::SFTP(_) => SyncError::transfer(path, err.message()),
        ErrorCode::Session(_) => SyncError::connection(target, format!("{}: {}", path, err.message())),
    }
}

fn is_missing(err: &ssh2::Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::SFTP(FX_NO_SUCH_FILE) | ErrorCode::SFTP(FX_NO_SUCH_PATH)
    )
}

fn stat_opt(sftp: &Sftp, target: &str, path: &str) -> Result<Option<FileStat>> {
    match sftp.stat(Path::new(path)) {
        Ok(stat) => Ok(Some(stat)),
        Err(e) if is_missing(&e) => Ok(None),
        Err(e) => Err(map_ssh_error(target, path, e)),
    }
}

fn mkdir_tolerant(sftp: &Sftp, target: &str, dir: &str) -> Result<()> {
    match sftp.mkdir(Path::new(dir), 0o755) {
        Ok(()) => Ok(()),
        Err(e) => match stat_opt(sftp, target, dir)? {
            Some(stat) if stat.is_dir() => Ok(()),
            _ => Err(map_ssh_error(target, dir, e)),
        },
    }
}

fn remove_tree(sftp: &Sftp, target: &str, dir: &str) -> Result<()> {
    let entries = sftp
        .readdir(Path::new(dir))
        .map_err(|e| map_ssh_error(target, dir, e))?;
    for (path, stat) in entries {
        let child = path.to_string_lossy().into_owned();
        if stat.is_dir() {
            remove_tree(sftp, target, &child)?;
        } else {
            sftp.unlink(&path).map_err(|e| map_ssh_error(target, &child, e))?;
        }
    }
    sftp.rmdir(Path::new(dir))
        .map_err(|e| map_ssh_error(target, dir, e))
}

fn upload(sftp: &Sftp, target: &str, local: &Path, dest: &str) -> Result<u64> {
    let mut input = File::open(local).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SyncError::PathNotFound {
            path: local.to_path_buf(),
        },
        _ => SyncError::io(format!("opening {}", local.display()), e),
    })?;
    let mtime = input
        .metadata()
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs());

    let tmp = temp_sibling(dest);
    let tmp_path = Path::new(&tmp);

    let copied = sftp
        .create(tmp_path)
        .map_err(|e| map_ssh_error(target, &tmp, e))
        .and_then(|mut remote| {
            io::copy(&mut input, &mut remote).map_err(|e| SyncError::transfer(dest, e))
        });
    let bytes = match copied {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = sftp.unlink(tmp_path);
            return Err(err);
        }
    };

    if let Some(mtime) = mtime {
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: None,
            atime: Some(mtime),
            mtime: Some(mtime),
        };
        if let Err(e) = sftp.setstat(tmp_path, stat) {
            debug!(path = %dest, "could not set remote mtime: {}", e.message());
        }
    }

    let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
    if sftp.rename(tmp_path, Path::new(dest), Some(flags)).is_err() {
        // Servers without posix-rename refuse to overwrite.
        let _ = sftp.unlink(Path::new(dest));
        if let Err(e) = sftp.rename(tmp_path, Path::new(dest), None) {
            let _ = sftp.unlink(tmp_path);
            return Err(map_ssh_error(target, dest, e));
        }
    }
    Ok(bytes)
}

#[async_trait]
impl TransportAdapter for SshTransport {
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
        let live = tokio::task::spawn_blocking(move || {
            open_session(&name, &address, &credentials, timeout)
        })
        .await
        .map_err(|e| SyncError::connection(&self.target.name, e))??;

        let mut guard = self
            .conn
            .lock()
            .map_err(|_| SyncError::connection(&self.target.name, "connection lock poisoned"))?;
        *guard = Some(live);
        info!(target_name = %self.target.name, "connected to {} via SFTP", self.address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let live = match self.conn.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        self.dirs.clear().await;
        if let Some(live) = live {
            let SshConnection { session, sftp } = live;
            tokio::task::spawn_blocking(move || {
                drop(sftp);
                if let Err(e) = session.disconnect(None, "driftsync session closed", None) {
                    warn!("ssh disconnect: {}", e.message());
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
                self.with_sftp(move |sftp| mkdir_tolerant(sftp, &name, &dir))
            })
            .await
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>> {
        let name = self.target.name.clone();
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            Ok(stat_opt(sftp, &name, &path)?
                .filter(|s| !s.is_dir())
                .map(|s| RemoteStat {
                    size: s.size.unwrap_or(0),
                    modified: s.mtime.and_then(|t| DateTime::from_timestamp(t as i64, 0)),
                }))
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
        self.with_sftp(move |sftp| upload(sftp, &name, &local, &dest))
            .await
    }

    async fn remove(&self, dest: &str) -> Result<()> {
        let name = self.target.name.clone();
        let path = dest.to_string();
        let removed_dir = self
            .with_sftp(move |sftp| match stat_opt(sftp, &name, &path)? {
                None => Ok(false),
                Some(stat) if stat.is_dir() => remove_tree(sftp, &name, &path).map(|_| true),
                Some(_) => match sftp.unlink(Path::new(&path)) {
                    Ok(()) => Ok(false),
                    Err(e) if is_missing(&e) => Ok(false),
                    Err(e) => Err(map_ssh_error(&name, &path, e)),
                },
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
            .with_sftp(move |sftp| match sftp.readdir(Path::new(&dir)) {
                Ok(entries) if entries.is_empty() => sftp
                    .rmdir(Path::new(&dir))
                    .map(|_| true)
                    .map_err(|e| map_ssh_error(&name, &dir, e)),
                Ok(_) => Ok(false),
                Err(e) if is_missing(&e) => Ok(false),
                Err(e) => Err(map_ssh_error(&name, &dir, e)),
            })
            .await?;
        if removed {
            self.dirs.forget(path).await;
        }
        Ok(removed)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    fn describe(&self) -> String {
        format!(
            "sftp://{}@{}{}",
            self.credentials.user, self.address, self.target.dest_root
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TransportTarget {
        let mut target = TransportTarget::local("prod", "/var/www");
        target.protocol = Protocol::Ssh;
        target.host = Some("example.com".to_string());
        target.credentials = Some(Credentials {
            user: "deploy".to_string(),
            password: Some("secret".to_string()),
            ..Default::default()
        });
        target
    }

    #[test]
    fn test_new_requires_host_and_credentials() {
        let mut no_host = target();
        no_host.host = None;
        assert!(matches!(SshTransport::new(no_host), Err(SyncError::Config(_))));

        let mut no_creds = target();
        no_creds.credentials = None;
        assert!(matches!(SshTransport::new(no_creds), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_describe_uses_default_port() {
        let transport = SshTransport::new(target()).unwrap();
        assert_eq!(transport.describe(), "sftp://deploy@example.com:22/var/www");
        assert_eq!(transport.protocol(), Protocol::Ssh);
    }

    #[test]
    fn test_error_mapping() {
        let lost = ssh2::Error::new(ErrorCode::SFTP(FX_CONNECTION_LOST), "connection lost");
        assert!(map_ssh_error("prod", "/a", lost).is_connection_loss());

        let denied = ssh2::Error::new(ErrorCode::SFTP(FX_PERMISSION_DENIED), "denied");
        assert!(matches!(
            map_ssh_error("prod", "/a", denied),
            SyncError::InvalidDestination { .. }
        ));

        let failure = ssh2::Error::new(ErrorCode::SFTP(4), "failure");
        let mapped = map_ssh_error("prod", "/a", failure);
        assert!(mapped.is_retryable());
        assert!(!mapped.is_connection_loss());

        assert!(is_missing(&ssh2::Error::new(ErrorCode::SFTP(FX_NO_SUCH_FILE), "missing")));
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_safe() {
        let transport = SshTransport::new(target()).unwrap();
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
    }
}
