// Watch sessions against a real directory and an in-memory destination

use std::fs;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::oneshot;

use driftsync::sync::SessionState;

use crate::support::{memory_session, session_config, wait_until, MemoryTransport, DEST_ROOT};

const SETTLE: Duration = Duration::from_secs(5);

fn puts_to(transport: &MemoryTransport, dest: &str) -> usize {
    transport.put_log().iter().filter(|d| d.as_str() == dest).count()
}

#[tokio::test]
async fn test_watch_uploads_and_removes_changes() {
    let src = tempdir().unwrap();
    let transport = MemoryTransport::new();
    let session = memory_session(session_config(src.path(), DEST_ROOT, &["*.scratch"]), &transport);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(session.clone().watch_owned(async move {
        let _ = stop_rx.await;
    }));
    assert!(wait_until(SETTLE, || session.state() == SessionState::Watching).await);

    fs::write(src.path().join("x.txt"), "hi").unwrap();
    fs::write(src.path().join("notes.scratch"), "ignored").unwrap();
    assert!(wait_until(SETTLE, || transport.file("/remote/www/x.txt").is_some()).await);
    assert_eq!(transport.file("/remote/www/x.txt").unwrap(), b"hi".to_vec());
    // Create and write notifications settle into a single upload.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(puts_to(&transport, "/remote/www/x.txt"), 1);

    fs::remove_file(src.path().join("x.txt")).unwrap();
    assert!(wait_until(SETTLE, || MemoryTransport::count(&transport.removes) == 1).await);
    assert!(transport.file("/remote/www/x.txt").is_none());

    stop_tx.send(()).unwrap();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.state, SessionState::Completed);
    assert!(transport
        .put_log()
        .iter()
        .all(|dest| !dest.ends_with("notes.scratch")));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(MemoryTransport::count(&transport.disconnects), 1);
}

#[tokio::test]
async fn test_rapid_writes_are_coalesced() {
    let src = tempdir().unwrap();
    let transport = MemoryTransport::new();
    let session = memory_session(session_config(src.path(), DEST_ROOT, &[]), &transport);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(session.clone().watch_owned(async move {
        let _ = stop_rx.await;
    }));
    assert!(wait_until(SETTLE, || session.state() == SessionState::Watching).await);

    let file = src.path().join("burst.txt");
    for i in 0..5 {
        fs::write(&file, format!("version {}", i)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(wait_until(SETTLE, || transport.file("/remote/www/burst.txt").as_deref()
        == Some(b"version 4".as_slice()))
    .await);

    // Let any late notifications settle before counting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(puts_to(&transport, "/remote/www/burst.txt"), 1);

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_removing_last_file_prunes_directory() {
    let src = tempdir().unwrap();
    let transport = MemoryTransport::new();
    let session = memory_session(session_config(src.path(), DEST_ROOT, &[]), &transport);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(session.clone().watch_owned(async move {
        let _ = stop_rx.await;
    }));
    assert!(wait_until(SETTLE, || session.state() == SessionState::Watching).await);

    fs::create_dir(src.path().join("sub")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    fs::write(src.path().join("sub/x.txt"), "nested").unwrap();
    assert!(wait_until(SETTLE, || transport.file("/remote/www/sub/x.txt").is_some()).await);
    assert!(transport.has_dir("/remote/www/sub"));

    fs::remove_file(src.path().join("sub/x.txt")).unwrap();
    assert!(wait_until(SETTLE, || !transport.has_dir("/remote/www/sub")).await);
    assert!(transport.has_dir(DEST_ROOT));

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_discards_pending_changes() {
    let src = tempdir().unwrap();
    let transport = MemoryTransport::new();
    let mut config = session_config(src.path(), DEST_ROOT, &[]);
    config.watch.debounce = Duration::from_secs(30);
    let session = memory_session(config, &transport);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(session.clone().watch_owned(async move {
        let _ = stop_rx.await;
    }));
    assert!(wait_until(SETTLE, || session.state() == SessionState::Watching).await);

    // Closing the watcher flushes the coalescer; those changes are dropped too.
    for i in 0..4 {
        fs::write(src.path().join(format!("late{}.txt", i)), "never sent").unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop_tx.send(()).unwrap();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(MemoryTransport::count(&transport.puts), 0);
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_initial_sync_runs_before_watching() {
    let src = tempdir().unwrap();
    fs::write(src.path().join("existing.txt"), "already here").unwrap();
    let transport = MemoryTransport::new();
    let mut config = session_config(src.path(), DEST_ROOT, &[]);
    config.watch.initial_sync = true;
    let session = memory_session(config, &transport);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(session.clone().watch_owned(async move {
        let _ = stop_rx.await;
    }));
    assert!(wait_until(SETTLE, || session.state() == SessionState::Watching).await);
    assert!(transport.file("/remote/www/existing.txt").is_some());

    stop_tx.send(()).unwrap();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.succeeded, 1);
}
