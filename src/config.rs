//! `driftsync.toml` configuration.
//!
//! ```toml
//! parallel_deploy = false
//! ignore_patterns = ["*.log", "node_modules/"]
//!
//! [watch]
//! debounce_ms = 300
//!
//! [hosts.production]
//! protocol = "ssh"
//! host = "example.com"
//! user = "deploy"
//! key_path = "~/.ssh/id_ed25519"
//! source_path = "./dist"
//! dest_path = "/var/www/app"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::fs::{Credentials, Protocol, TransportTarget};
use crate::sync::engine::{RetrySettings, SessionConfig, WatchSettings};
use crate::sync::retry::Backoff;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "driftsync.toml";

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_source_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_concurrency() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Deploy all hosts at once instead of one after another.
    #[serde(default)]
    pub parallel_deploy: bool,

    /// Patterns applied to every host, before the host's own.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub initial_sync: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            initial_sync: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub protocol: Protocol,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub passphrase: Option<String>,
    #[serde(default = "default_source_path")]
    pub source_path: PathBuf,
    pub dest_path: String,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_true")]
    pub skip_unchanged: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::io(format!("reading {}", path.display()), e))?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts < 1 {
            return Err(SyncError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        for (name, host) in &self.hosts {
            host.validate(name)?;
        }
        Ok(())
    }

    /// Hosts to run. With an empty `selected` every enabled host in name
    /// order; otherwise the named hosts, which must exist. A named host that
    /// is disabled is skipped with a warning.
    pub fn enabled_hosts(&self, selected: &[String]) -> Result<Vec<(&str, &HostConfig)>> {
        let hosts: Vec<(&str, &HostConfig)> = if selected.is_empty() {
            self.hosts
                .iter()
                .filter(|(_, host)| host.enabled)
                .map(|(name, host)| (name.as_str(), host))
                .collect()
        } else {
            let mut hosts = Vec::with_capacity(selected.len());
            for name in selected {
                let (name, host) = self
                    .hosts
                    .get_key_value(name)
                    .ok_or_else(|| SyncError::Config(format!("unknown host '{}'", name)))?;
                if host.enabled {
                    hosts.push((name.as_str(), host));
                } else {
                    warn!(host = name.as_str(), "host is disabled, skipping");
                }
            }
            hosts
        };

        if hosts.is_empty() {
            return Err(SyncError::Config("no hosts enabled".to_string()));
        }
        Ok(hosts)
    }
}

impl HostConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        let invalid = |reason: &str| Err(SyncError::Config(format!("host '{}': {}", name, reason)));

        if self.dest_path.trim().is_empty() {
            return invalid("dest_path must not be empty");
        }
        if self.concurrency < 1 {
            return invalid("concurrency must be at least 1");
        }
        if matches!(self.protocol, Protocol::Ssh | Protocol::Ftp) {
            if self.host.as_deref().map_or(true, str::is_empty) {
                return invalid("host is required");
            }
            if self.user.as_deref().map_or(true, str::is_empty) {
                return invalid("user is required");
            }
        }
        if self.protocol == Protocol::Ftp && self.password.is_none() {
            return invalid("password is required for ftp");
        }
        Ok(())
    }

    pub fn target(&self, name: &str) -> TransportTarget {
        let credentials = self.user.as_ref().map(|user| Credentials {
            user: user.clone(),
            password: self.password.clone(),
            key_path: self.key_path.as_deref().map(expand_tilde),
            passphrase: self.passphrase.clone(),
        });

        TransportTarget {
            name: name.to_string(),
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            credentials,
            dest_root: self.dest_path.clone(),
            concurrency_limit: self.concurrency,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    /// Session settings for this host. Global ignore patterns come first so
    /// the host's own patterns win under last-match semantics. The ignore
    /// file is left for the caller to read.
    pub fn to_session_config(&self, name: &str, globals: &Config) -> SessionConfig {
        let mut config = SessionConfig::new(self.source_path.clone(), self.target(name));
        config.ignore_patterns = globals
            .ignore_patterns
            .iter()
            .chain(&self.ignore_patterns)
            .cloned()
            .collect();
        config.watch = WatchSettings {
            enabled: false,
            debounce: Duration::from_millis(globals.watch.debounce_ms),
            initial_sync: globals.watch.initial_sync,
        };
        config.retry = RetrySettings {
            max_attempts: globals.retry.max_attempts,
            delay: Duration::from_millis(globals.retry.delay_ms),
            backoff: globals.retry.backoff,
        };
        config.skip_unchanged = self.skip_unchanged;
        config
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
