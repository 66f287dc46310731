//! Synchronization engine.
//!
//! Change detection and debouncing, ignore rules, task dispatch under retry
//! and progress accounting. Transports live in [`crate::fs`].

pub mod coalescer;
pub mod engine;
pub mod ignore;
pub mod progress;
pub mod retry;
pub mod status;
pub mod task;
pub mod watcher;

pub use coalescer::{ChangeCoalescer, ChangeEvent, CoalescerCommand};
pub use engine::{
    RetrySettings, SessionConfig, SessionState, SyncOrchestrator, SyncReport, WatchSettings,
};
pub use ignore::{IgnoreMatcher, IgnoreRule, IGNORE_FILE_NAME};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use retry::{Backoff, RetryOutcome, RetryPolicy};
pub use status::{ChannelStatus, NullStatus, StatusEvent, StatusSink, TracingStatus};
pub use task::{Fingerprint, FingerprintLocks, TaskKind, TransferResult, TransferStatus, TransferTask};
pub use watcher::{ChangeKind, ChangeWatcher, RawEvent};
