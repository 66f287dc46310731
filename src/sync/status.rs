//! Status callbacks from a session to whatever presents it.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::sync::engine::SessionState;
use crate::sync::progress::ProgressSnapshot;
use crate::sync::task::{TaskKind, TransferResult, TransferStatus};

/// Receives session events. Injected at construction; called from transfer
/// tasks, so implementations must be cheap and must not block.
pub trait StatusSink: Send + Sync {
    fn on_state(&self, _target: &str, _state: SessionState) {}

    fn on_result(&self, target: &str, result: &TransferResult);

    fn on_progress(&self, _target: &str, _snapshot: &ProgressSnapshot) {}
}

/// Writes every event to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatus;

impl StatusSink for TracingStatus {
    fn on_state(&self, target: &str, state: SessionState) {
        debug!(host = target, ?state, "session state");
    }

    fn on_result(&self, target: &str, result: &TransferResult) {
        let path = result.task.relative_path.as_str();
        match (result.status, result.task.kind) {
            (TransferStatus::Ok, TaskKind::Upload) => {
                info!(host = target, path, bytes = result.bytes_sent, "uploaded")
            }
            (TransferStatus::Ok, TaskKind::Remove) => info!(host = target, path, "removed"),
            (TransferStatus::Skipped, _) => debug!(
                host = target,
                path,
                reason = result.reason.as_deref().unwrap_or(""),
                "skipped"
            ),
            (TransferStatus::Failed, _) => warn!(
                host = target,
                path,
                attempts = result.attempts,
                "failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatus;

impl StatusSink for NullStatus {
    fn on_result(&self, _target: &str, _result: &TransferResult) {}
}

#[derive(Debug, Clone)]
pub enum StatusEvent {
    State {
        target: String,
        state: SessionState,
    },
    Result {
        target: String,
        result: TransferResult,
    },
    Progress {
        target: String,
        snapshot: ProgressSnapshot,
    },
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelStatus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelStatus {
    fn on_state(&self, target: &str, state: SessionState) {
        let _ = self.tx.send(StatusEvent::State {
            target: target.to_string(),
            state,
        });
    }

    fn on_result(&self, target: &str, result: &TransferResult) {
        let _ = self.tx.send(StatusEvent::Result {
            target: target.to_string(),
            result: result.clone(),
        });
    }

    fn on_progress(&self, target: &str, snapshot: &ProgressSnapshot) {
        let _ = self.tx.send(StatusEvent::Progress {
            target: target.to_string(),
            snapshot: snapshot.clone(),
        });
    }
}
