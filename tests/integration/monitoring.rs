//! End-to-end monitoring through a real enforcer

use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use falcon::client::ClientCoordinator;
use falcon::enforcer::GenerationLog;
use falcon::status::FalconStatus;

use super::helpers::{
    chain, client_config, enforcer_config, next_terminal, recorder, start_enforcer, wait_until,
    WAIT,
};

#[test]
#[serial]
fn test_alive_target_reports_sign_of_life() {
    let dir = TempDir::new().unwrap();
    let enforcer = start_enforcer(&enforcer_config(&dir));
    let coordinator =
        ClientCoordinator::start(&client_config(&[("hostA", enforcer.local_addr())])).unwrap();

    let (callback, statuses) = recorder();
    let target = coordinator
        .start_monitoring(&chain(&["alive", "hostA"]), false, Some(callback.clone()), None, 0)
        .unwrap();
    // Liveness is delivered through the armed watchdog.
    target.start_monitoring(callback, Duration::from_secs(30));

    assert_eq!(statuses.recv_timeout(WAIT).unwrap(), FalconStatus::SignOfLife);
    assert_eq!(statuses.recv_timeout(WAIT).unwrap(), FalconStatus::SignOfLife);
    assert!(target.query_alive());

    target.uninit();
    assert!(wait_until(WAIT, || target.leaf().is_none()));
    assert!(target.query_alive());
}

#[test]
#[serial]
fn test_dead_target_reports_would_kill_without_license() {
    let dir = TempDir::new().unwrap();
    let config = enforcer_config(&dir);
    let enforcer = start_enforcer(&config);
    let coordinator =
        ClientCoordinator::start(&client_config(&[("hostA", enforcer.local_addr())])).unwrap();

    let (callback, statuses) = recorder();
    let target = coordinator
        .start_monitoring(&chain(&["dead", "hostA"]), false, Some(callback), None, -1)
        .unwrap();

    assert_eq!(
        next_terminal(&statuses, WAIT),
        Some(FalconStatus::RemoteWouldKill)
    );
    assert!(!target.query_alive());
    assert!(wait_until(WAIT, || {
        GenerationLog::replay(&config.generation_log)
            .map(|counters| counters.get("dead") == Some(&1))
            .unwrap_or(false)
    }));
}

#[test]
#[serial]
fn test_dead_target_with_license_reports_killed() {
    let dir = TempDir::new().unwrap();
    let enforcer = start_enforcer(&enforcer_config(&dir));
    let coordinator =
        ClientCoordinator::start(&client_config(&[("hostA", enforcer.local_addr())])).unwrap();

    let (callback, statuses) = recorder();
    coordinator
        .start_monitoring(&chain(&["dead", "hostA"]), true, Some(callback), None, -1)
        .unwrap();

    assert_eq!(
        next_terminal(&statuses, WAIT),
        Some(FalconStatus::KilledByRemote)
    );
}

#[test]
#[serial]
fn test_stuck_target_is_killed_after_timeout() {
    let dir = TempDir::new().unwrap();
    let config = enforcer_config(&dir);
    let enforcer = start_enforcer(&config);
    let coordinator =
        ClientCoordinator::start(&client_config(&[("hostA", enforcer.local_addr())])).unwrap();

    let (callback, statuses) = recorder();
    let target = coordinator
        .start_monitoring(&chain(&["stuck", "hostA"]), true, Some(callback), None, -1)
        .unwrap();
    target.start_timer(Duration::from_millis(300));

    // The enforcer's Down lands before the watchdog settles on a timeout.
    assert_eq!(
        next_terminal(&statuses, WAIT),
        Some(FalconStatus::KilledByRemote)
    );
    assert!(next_terminal(&statuses, Duration::from_millis(500)).is_none());

    assert!(wait_until(WAIT, || {
        GenerationLog::replay(&config.generation_log)
            .map(|counters| counters.get("stuck") == Some(&1))
            .unwrap_or(false)
    }));
    assert!(wait_until(WAIT, || target.leaf().is_none()));
}

#[test]
#[serial]
fn test_unknown_layer_fails_registration() {
    let dir = TempDir::new().unwrap();
    let enforcer = start_enforcer(&enforcer_config(&dir));
    let coordinator =
        ClientCoordinator::start(&client_config(&[("hostA", enforcer.local_addr())])).unwrap();

    let (callback, statuses) = recorder();
    let result =
        coordinator.start_monitoring(&chain(&["ghost", "hostA"]), false, Some(callback), None, -1);

    assert!(result.is_err());
    assert_eq!(
        next_terminal(&statuses, WAIT),
        Some(FalconStatus::RegistrationError)
    );
}

#[test]
#[serial]
fn test_deferred_down_is_replayed_on_set_callback() {
    let dir = TempDir::new().unwrap();
    let enforcer = start_enforcer(&enforcer_config(&dir));
    let coordinator =
        ClientCoordinator::start(&client_config(&[("hostA", enforcer.local_addr())])).unwrap();

    let target = coordinator
        .init(&chain(&["dead", "hostA"]), false, None, -1)
        .unwrap();
    assert!(wait_until(WAIT, || !target.query_alive()));

    let (callback, statuses) = recorder();
    assert!(target.set_callback(callback));
    assert_eq!(
        next_terminal(&statuses, WAIT),
        Some(FalconStatus::RemoteWouldKill)
    );
}
