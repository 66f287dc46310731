//! Runs sessions for every selected host.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{Config, HostConfig};
use crate::sync::engine::{SyncOrchestrator, SyncReport};
use crate::sync::ignore::IGNORE_FILE_NAME;
use crate::sync::status::StatusSink;

/// Result of one host's session.
#[derive(Debug)]
pub struct HostOutcome {
    pub name: String,
    pub result: Result<SyncReport>,
}

impl HostOutcome {
    pub fn is_success(&self) -> bool {
        matches!(&self.result, Ok(report) if report.is_success())
    }
}

/// Read the ignore file from a source root, if present.
pub async fn read_ignore_file(source_root: &Path) -> Result<Option<String>> {
    let path = source_root.join(IGNORE_FILE_NAME);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

async fn build_session(
    name: &str,
    host: &HostConfig,
    config: &Config,
    status: Arc<dyn StatusSink>,
) -> Result<SyncOrchestrator> {
    let mut session = host.to_session_config(name, config);
    session.ignore_file_content = read_ignore_file(&session.source_root).await?;
    SyncOrchestrator::new(session, status)
        .with_context(|| format!("Failed to set up host '{}'", name))
}

async fn deploy_host(
    name: &str,
    host: &HostConfig,
    config: &Config,
    status: Arc<dyn StatusSink>,
) -> HostOutcome {
    info!(host = name, protocol = host.protocol.short_name(), "deploying");
    let result = async {
        let session = build_session(name, host, config, status).await?;
        session
            .deploy()
            .await
            .with_context(|| format!("Deploy to '{}' failed", name))
    }
    .await;

    if let Err(err) = &result {
        error!(host = name, "{:#}", err);
    }
    HostOutcome {
        name: name.to_string(),
        result,
    }
}

/// Full sync of every selected host, one after another or all at once
/// depending on `parallel_deploy`.
pub async fn deploy(
    config: &Config,
    selected: &[String],
    status: Arc<dyn StatusSink>,
) -> Result<Vec<HostOutcome>> {
    let hosts = config.enabled_hosts(selected)?;

    if config.parallel_deploy {
        let runs = hosts
            .into_iter()
            .map(|(name, host)| deploy_host(name, host, config, Arc::clone(&status)));
        return Ok(join_all(runs).await);
    }

    let mut outcomes = Vec::with_capacity(hosts.len());
    for (name, host) in hosts {
        outcomes.push(deploy_host(name, host, config, Arc::clone(&status)).await);
    }
    Ok(outcomes)
}

/// Watch every selected host concurrently until `shutdown` resolves. Each
/// session ends on its own if its connection is lost.
pub async fn watch<F>(
    config: &Config,
    selected: &[String],
    status: Arc<dyn StatusSink>,
    shutdown: F,
) -> Result<Vec<HostOutcome>>
where
    F: Future<Output = ()>,
{
    let hosts = config.enabled_hosts(selected)?;
    let (stop_tx, stop_rx) = watch::channel(false);

    let sessions = hosts.into_iter().map(|(name, host)| {
        let status = Arc::clone(&status);
        let mut stop_rx = stop_rx.clone();
        async move {
            let result = async {
                let session = build_session(name, host, config, status).await?;
                let stopped = async move {
                    let _ = stop_rx.wait_for(|stop| *stop).await;
                };
                session
                    .watch(stopped)
                    .await
                    .with_context(|| format!("Watch session for '{}' failed", name))
            }
            .await;

            if let Err(err) = &result {
                error!(host = name, "{:#}", err);
            }
            HostOutcome {
                name: name.to_string(),
                result,
            }
        }
    });

    let all = join_all(sessions);
    tokio::pin!(all);
    tokio::pin!(shutdown);
    tokio::select! {
        outcomes = &mut all => return Ok(outcomes),
        _ = &mut shutdown => {
            info!("stopping watch sessions");
            let _ = stop_tx.send(true);
        }
    }
    Ok(all.await)
}
