// Retry bound and error classification through the orchestrator

use std::fs;
use tempfile::tempdir;

use driftsync::sync::{SessionState, TransferStatus};

use crate::support::{memory_session, session_config, Failure, MemoryTransport, DEST_ROOT};

#[tokio::test]
async fn test_failing_transport_is_called_max_attempts_times() {
    let src = tempdir().unwrap();
    fs::write(src.path().join("a.txt"), "x").unwrap();

    let transport = MemoryTransport::new();
    transport.fail_with(Failure::Transient);
    let mut config = session_config(src.path(), DEST_ROOT, &[]);
    config.retry.max_attempts = 4;
    let session = memory_session(config, &transport);

    let report = session.deploy().await.unwrap();
    assert_eq!(MemoryTransport::count(&transport.puts), 4);
    assert_eq!(report.failed, 1);
    assert_eq!(report.results[0].status, TransferStatus::Failed);
    assert_eq!(report.results[0].attempts, 4);
    assert!(report.results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("timed out"));

    // A file failure is recorded but does not fail the session.
    assert_eq!(report.state, SessionState::Completed);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_failures_do_not_abort_the_batch() {
    let src = tempdir().unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(src.path().join(name), "x").unwrap();
    }

    let transport = MemoryTransport::new();
    transport.fail_with(Failure::Transient);
    let mut config = session_config(src.path(), DEST_ROOT, &[]);
    config.retry.max_attempts = 2;
    let session = memory_session(config, &transport);

    let report = session.deploy().await.unwrap();
    assert_eq!(report.failed, 3);
    assert_eq!(MemoryTransport::count(&transport.puts), 6);
}
