//! Warm starts, stale and corrupted journals, and write gating.

mod support;

use std::fs;
use std::time::Duration;
use tokio::time::sleep;

use sqlgate_common::status::{SERVER_MASTER, SERVER_RUNNING, SERVER_SLAVE};

use support::{tempdir, test_settings, wait_ticks, Harness};

fn journal_path(dir: &std::path::Path) -> std::path::PathBuf {
    dir.join("cluster").join("monitor.dat")
}

/// Run one monitored tick so the journal on disk describes a master "a"
/// and a slave "b", then stop.
async fn seed_journal(dir: &std::path::Path) {
    let harness = Harness::new(dir);
    let a = harness.add_backend("a", 3306);
    let b = harness.add_backend("b", 3307);
    harness.mock.make_master("a", 1);
    harness.mock.make_slave("b", 2, 1);

    let monitor = harness.monitors.create("cluster", "replication").unwrap();
    monitor.configure(test_settings(25), vec![a, b]).unwrap();
    monitor.start().await.unwrap();
    wait_ticks(&monitor, 1).await;
    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn test_warm_start_restores_view_before_first_tick() {
    let dir = tempdir();
    seed_journal(dir.path()).await;

    // A fresh process: new registries, same data directory. Slow connects
    // keep the first tick in flight while we look at the restored state.
    let harness = Harness::new(dir.path());
    let a = harness.add_backend("a", 3306);
    let b = harness.add_backend("b", 3307);
    harness.mock.make_master("a", 1);
    harness.mock.make_slave("b", 2, 1);
    harness.mock.update("a", |state| {
        state.connect_delay = Duration::from_millis(300)
    });
    harness.mock.update("b", |state| {
        state.connect_delay = Duration::from_millis(300)
    });

    let monitor = harness.monitors.create("cluster", "replication").unwrap();
    monitor.configure(test_settings(25), vec![a.clone(), b.clone()]).unwrap();
    monitor.start().await.unwrap();

    // start() returns after the journal is loaded but before the first
    // tick completes.
    assert_eq!(monitor.ticks(), 0);
    assert_ne!(a.status() & SERVER_MASTER, 0);
    assert_ne!(a.status() & SERVER_RUNNING, 0);
    assert_ne!(b.status() & SERVER_SLAVE, 0);

    wait_ticks(&monitor, 1).await;
    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_journal_starts_empty_and_is_rewritten() {
    let dir = tempdir();
    seed_journal(dir.path()).await;

    // Truncate the journal by one byte.
    let path = journal_path(dir.path());
    let mut buf = fs::read(&path).unwrap();
    buf.pop();
    fs::write(&path, &buf).unwrap();

    let harness = Harness::new(dir.path());
    let a = harness.add_backend("a", 3306);
    let b = harness.add_backend("b", 3307);
    harness.mock.make_master("a", 1);
    harness.mock.make_slave("b", 2, 1);
    harness.mock.update("a", |state| {
        state.connect_delay = Duration::from_millis(300)
    });

    let monitor = harness.monitors.create("cluster", "replication").unwrap();
    monitor.configure(test_settings(25), vec![a.clone(), b]).unwrap();
    monitor.start().await.unwrap();

    // The journal was discarded: only the assumed-running default remains,
    // no restored master bit.
    assert_eq!(monitor.ticks(), 0);
    assert_eq!(a.status(), SERVER_RUNNING);

    // The first tick writes a fresh, decodable journal.
    wait_ticks(&monitor, 1).await;
    monitor.stop().await.unwrap();

    let snapshot = sqlgate_monitor::journal::decode(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(snapshot.master.as_deref(), Some("a"));
    assert_eq!(snapshot.servers.len(), 2);
}

#[tokio::test]
async fn test_stale_journal_removed_at_start() {
    let dir = tempdir();
    seed_journal(dir.path()).await;
    assert!(journal_path(dir.path()).exists());

    sleep(Duration::from_millis(1_100)).await;

    let harness = Harness::new(dir.path());
    let a = harness.add_backend("a", 3306);
    harness.mock.make_master("a", 1);
    harness.mock.update("a", |state| {
        state.connect_delay = Duration::from_millis(300)
    });

    let mut settings = test_settings(25);
    settings.journal_max_age_s = 1;

    let monitor = harness.monitors.create("cluster", "replication").unwrap();
    monitor.configure(settings, vec![a.clone()]).unwrap();
    monitor.start().await.unwrap();

    // The stale journal was deleted before the load: no restored state.
    assert_eq!(a.status(), SERVER_RUNNING);
    wait_ticks(&monitor, 1).await;
    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn test_journal_write_is_hash_gated() {
    let dir = tempdir();
    let harness = Harness::new(dir.path());
    let a = harness.add_backend("a", 3306);
    harness.mock.make_master("a", 1);

    let monitor = harness.monitors.create("cluster", "replication").unwrap();
    monitor.configure(test_settings(20), vec![a]).unwrap();
    monitor.start().await.unwrap();
    wait_ticks(&monitor, 2).await;

    // Steady state: the snapshot stops changing, so writes stop too.
    let path = journal_path(dir.path());
    let mtime = fs::metadata(&path).unwrap().modified().unwrap();
    let before = monitor.ticks();
    wait_ticks(&monitor, before + 5).await;
    assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), mtime);

    monitor.stop().await.unwrap();
}
