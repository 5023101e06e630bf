//! Connection prober outcomes against the mock protocol.

mod support;

use std::time::Duration;

use sqlgate_monitor::probe::{probe, ProbeOutcome};
use sqlgate_monitor::settings::ConnectionSettings;

use support::{tempdir, Harness};

fn settings(connect_timeout_ms: u64, attempts: u32) -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout_ms,
        connect_attempts: attempts,
        ..ConnectionSettings::default()
    }
}

#[tokio::test]
async fn test_new_connection_then_existing_ok() {
    let dir = tempdir();
    let harness = Harness::new(dir.path());
    let a = harness.add_backend("a", 3306);
    harness.mock.make_master("a", 1);

    let (conn, result) = probe(&harness.mock, &a, &settings(500, 1), None).await;
    assert_eq!(result.outcome, ProbeOutcome::NewConnOk);
    let conn = conn.expect("connection");

    // The live handle short-circuits the reconnect.
    let (conn, result) = probe(&harness.mock, &a, &settings(500, 1), Some(conn)).await;
    assert_eq!(result.outcome, ProbeOutcome::ExistingOk);
    assert!(conn.is_some());
    assert_eq!(harness.mock.get("a").connects, 1);
}

#[tokio::test]
async fn test_dead_handle_reconnects() {
    let dir = tempdir();
    let harness = Harness::new(dir.path());
    let a = harness.add_backend("a", 3306);
    harness.mock.make_master("a", 1);

    let (conn, _) = probe(&harness.mock, &a, &settings(500, 1), None).await;
    harness.mock.update("a", |state| state.ping_ok = false);

    let (conn, result) = probe(&harness.mock, &a, &settings(500, 1), conn).await;
    assert_eq!(result.outcome, ProbeOutcome::NewConnOk);
    assert!(conn.is_some());
    assert_eq!(harness.mock.get("a").connects, 2);
}

#[tokio::test]
async fn test_refused_outcome_carries_error() {
    let dir = tempdir();
    let harness = Harness::new(dir.path());
    let a = harness.add_backend("a", 3306);
    harness.mock.make_unreachable("a");

    let (conn, result) = probe(&harness.mock, &a, &settings(500, 1), None).await;
    assert!(conn.is_none());
    assert_eq!(result.outcome, ProbeOutcome::Refused);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_auth_failure_is_refused_with_access_denied() {
    let dir = tempdir();
    let harness = Harness::new(dir.path());
    let a = harness.add_backend("a", 3306);
    harness.mock.update("a", |state| state.auth_fail = true);

    let (_, result) = probe(&harness.mock, &a, &settings(500, 1), None).await;
    assert_eq!(result.outcome, ProbeOutcome::Refused);
    assert!(matches!(result.error, Some(ref err) if err.is_access_denied()));
}

#[tokio::test]
async fn test_slow_connect_classified_as_timeout() {
    let dir = tempdir();
    let harness = Harness::new(dir.path());
    let a = harness.add_backend("a", 3306);
    harness.mock.update("a", |state| {
        state.connect_delay = Duration::from_millis(400)
    });

    let (conn, result) = probe(&harness.mock, &a, &settings(100, 1), None).await;
    assert!(conn.is_none());
    assert_eq!(result.outcome, ProbeOutcome::Timeout);
}

#[tokio::test]
async fn test_all_attempts_are_made() {
    let dir = tempdir();
    let harness = Harness::new(dir.path());
    let a = harness.add_backend("a", 3306);
    harness.mock.make_unreachable("a");

    let (_, result) = probe(&harness.mock, &a, &settings(500, 3), None).await;
    assert_eq!(result.outcome, ProbeOutcome::Refused);
    assert_eq!(harness.mock.get("a").connects, 3);
}
