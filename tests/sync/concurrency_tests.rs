// Fingerprint locking and the per-target concurrency limit

use chrono::Utc;
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

use driftsync::sync::{ChangeEvent, ChangeKind};

use crate::support::{memory_session, session_config, MemoryTransport, DEST_ROOT};

fn modified(path: std::path::PathBuf) -> ChangeEvent {
    ChangeEvent {
        path,
        kind: ChangeKind::Modified,
        observed_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_same_destination_never_written_concurrently() {
    let src = tempdir().unwrap();
    let file = src.path().join("shared.txt");
    fs::write(&file, "x").unwrap();

    let transport = MemoryTransport::new();
    transport.set_put_delay(Duration::from_millis(50));
    let session = memory_session(session_config(src.path(), DEST_ROOT, &[]), &transport);
    session.connect().await.unwrap();

    let (first, second, third) = tokio::join!(
        session.apply_changes(vec![modified(file.clone())]),
        session.apply_changes(vec![modified(file.clone())]),
        session.apply_changes(vec![modified(file.clone())]),
    );

    assert_eq!(first.succeeded + second.succeeded + third.succeeded, 3);
    assert_eq!(MemoryTransport::count(&transport.puts), 3);
    assert_eq!(MemoryTransport::count(&transport.overlaps), 0);
}

#[tokio::test]
async fn test_concurrency_limit_bounds_in_flight_puts() {
    let src = tempdir().unwrap();
    for i in 0..8 {
        fs::write(src.path().join(format!("f{}.txt", i)), "x").unwrap();
    }

    let transport = MemoryTransport::new();
    transport.set_put_delay(Duration::from_millis(30));
    let mut config = session_config(src.path(), DEST_ROOT, &[]);
    config.target.concurrency_limit = 2;
    let session = memory_session(config, &transport);

    let report = session.deploy().await.unwrap();
    assert_eq!(report.succeeded, 8);
    let max = MemoryTransport::count(&transport.max_in_flight);
    assert!(max <= 2, "saw {} concurrent puts", max);
    assert!(max >= 1);
}
