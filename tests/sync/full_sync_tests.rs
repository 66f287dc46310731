// Full sync scenarios: ignore filtering, idempotence, connection loss

use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

use driftsync::fs::{LocalTransport, TransportTarget};
use driftsync::sync::{
    NullStatus, SessionConfig, SessionState, SyncOrchestrator, TaskKind, TransferStatus,
};

use crate::support::{memory_session, session_config, Failure, MemoryTransport, DEST_ROOT};

#[tokio::test]
async fn test_full_sync_skips_ignored_files() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    fs::write(src.path().join("a.txt"), "alpha").unwrap();
    fs::write(src.path().join("b.log"), "noise").unwrap();

    let target = TransportTarget::local("local", dst.path());
    let mut config = SessionConfig::new(src.path(), target.clone());
    config.ignore_patterns = vec!["*.log".to_string()];
    let session = SyncOrchestrator::with_adapter(
        config,
        Arc::new(LocalTransport::new(target)),
        Arc::new(NullStatus),
    )
    .unwrap();

    let report = session.deploy().await.unwrap();
    assert_eq!(report.state, SessionState::Completed);

    let mut names: Vec<_> = fs::read_dir(dst.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.txt"]);
    assert_eq!(fs::read_to_string(dst.path().join("a.txt")).unwrap(), "alpha");
}

#[tokio::test]
async fn test_second_full_sync_puts_nothing() {
    let src = tempdir().unwrap();
    fs::create_dir_all(src.path().join("assets/img")).unwrap();
    fs::write(src.path().join("index.html"), "<html/>").unwrap();
    fs::write(src.path().join("assets/site.css"), "body{}").unwrap();
    fs::write(src.path().join("assets/img/logo.svg"), "<svg/>").unwrap();

    let transport = MemoryTransport::new();
    let session = memory_session(session_config(src.path(), DEST_ROOT, &[]), &transport);

    let first = session.deploy().await.unwrap();
    assert_eq!(first.succeeded, 3);
    assert_eq!(MemoryTransport::count(&transport.puts), 3);
    assert_eq!(
        transport.file_names(),
        vec![
            "/remote/www/assets/img/logo.svg",
            "/remote/www/assets/site.css",
            "/remote/www/index.html",
        ]
    );

    let second = session.deploy().await.unwrap();
    assert_eq!(MemoryTransport::count(&transport.puts), 3);
    assert_eq!(second.skipped, 3);
    assert!(second
        .results
        .iter()
        .all(|r| r.reason.as_deref() == Some("up to date")));
    assert_eq!(MemoryTransport::count(&transport.disconnects), 2);
}

#[tokio::test]
async fn test_changed_file_is_uploaded_again() {
    let src = tempdir().unwrap();
    fs::write(src.path().join("a.txt"), "one").unwrap();
    fs::write(src.path().join("b.txt"), "two").unwrap();

    let transport = MemoryTransport::new();
    let session = memory_session(session_config(src.path(), DEST_ROOT, &[]), &transport);
    session.deploy().await.unwrap();

    fs::write(src.path().join("a.txt"), "longer content").unwrap();
    let report = session.deploy().await.unwrap();
    assert_eq!(report.count_ok(TaskKind::Upload), 1);
    assert_eq!(
        transport.file("/remote/www/a.txt").unwrap(),
        b"longer content".to_vec()
    );
}

#[tokio::test]
async fn test_connection_loss_skips_remaining_tasks() {
    let src = tempdir().unwrap();
    for i in 0..5 {
        fs::write(src.path().join(format!("f{}.txt", i)), "x").unwrap();
    }

    let transport = MemoryTransport::new();
    transport.fail_with(Failure::ConnectionLost);
    let mut config = session_config(src.path(), DEST_ROOT, &[]);
    config.target.concurrency_limit = 1;
    let session = memory_session(config, &transport);

    let report = session.deploy().await.unwrap();
    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 4);
    assert!(report
        .results
        .iter()
        .filter(|r| r.status == TransferStatus::Skipped)
        .all(|r| r.reason.as_deref() == Some("connection lost")));
    // Retried up to the limit, then nothing more was attempted.
    assert_eq!(MemoryTransport::count(&transport.puts), 3);
    assert_eq!(MemoryTransport::count(&transport.disconnects), 1);
}

#[tokio::test]
async fn test_authentication_failure_is_not_retried() {
    let src = tempdir().unwrap();
    fs::write(src.path().join("a.txt"), "x").unwrap();

    let transport = MemoryTransport::new();
    transport.fail_with(Failure::Auth);
    let session = memory_session(session_config(src.path(), DEST_ROOT, &[]), &transport);

    let err = session.deploy().await.unwrap_err();
    assert!(matches!(err, driftsync::SyncError::Authentication { .. }));
    assert_eq!(MemoryTransport::count(&transport.connects), 1);
    assert_eq!(MemoryTransport::count(&transport.puts), 0);
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_ignore_file_and_explicit_patterns() {
    let src = tempdir().unwrap();
    fs::create_dir_all(src.path().join("build")).unwrap();
    fs::write(src.path().join("build/out.js"), "x").unwrap();
    fs::write(src.path().join("app.log"), "x").unwrap();
    fs::write(src.path().join("keep.log"), "x").unwrap();
    fs::write(src.path().join("main.js"), "x").unwrap();

    let transport = MemoryTransport::new();
    let mut config = session_config(src.path(), DEST_ROOT, &["!keep.log"]);
    config.ignore_file_content = Some("# generated\nbuild/\n*.log\n".to_string());
    let session = memory_session(config, &transport);

    session.deploy().await.unwrap();
    assert_eq!(
        transport.file_names(),
        vec!["/remote/www/keep.log", "/remote/www/main.js"]
    );
}
