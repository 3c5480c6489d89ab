//! End-to-end tests of a single-voter group.

use std::time::Duration;

use tally_raft::{Command, RaftClusterManager, RaftConfig, RaftError};

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn config(dir: &std::path::Path) -> RaftConfig {
    RaftConfig::new("node1")
        .with_raft_addr(free_addr())
        .with_http_addr("127.0.0.1:9000")
        .with_heartbeat_interval_ms(50)
        .with_election_timeout_ms(150, 300)
        .with_snapshot_threshold(4)
        .with_data_dir(dir)
}

async fn leader(dir: &std::path::Path) -> RaftClusterManager {
    let manager = RaftClusterManager::new(config(dir)).await.unwrap();
    if !manager.has_prior_state() {
        manager.initialize_single().await.unwrap();
    }
    manager.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    manager
}

#[tokio::test]
async fn test_increments_are_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let manager = leader(dir.path()).await;

    for expected in 1..=3 {
        let response = manager.apply(Command::increment()).await.unwrap();
        assert_eq!(response.value, Some(expected));
    }
    assert_eq!(manager.counter().value(), 3);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_op_leaves_counter() {
    let dir = tempfile::tempdir().unwrap();
    let manager = leader(dir.path()).await;

    manager.apply(Command::increment()).await.unwrap();
    let response = manager.apply(Command::new("decrement")).await.unwrap();
    assert_eq!(response.value, None);
    assert_eq!(manager.counter().value(), 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_id_is_applied_once() {
    let dir = tempfile::tempdir().unwrap();
    let manager = leader(dir.path()).await;

    let cmd = Command::increment().with_request_id(Some("client-7".into()));
    let first = manager.apply(cmd.clone()).await.unwrap();
    let retry = manager.apply(cmd).await.unwrap();

    assert_eq!(first.value, Some(1));
    assert_eq!(retry.value, Some(1));
    assert!(retry.deduplicated);
    assert_eq!(manager.counter().value(), 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backup_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let manager = leader(dir.path()).await;
    let backup = manager.config().backup_path();

    let err = manager.counter().restore(&backup).unwrap_err();
    assert!(matches!(err, RaftError::BackupNotFound(_)));

    manager.apply(Command::increment()).await.unwrap();
    manager.apply(Command::increment()).await.unwrap();
    assert_eq!(manager.counter().backup(&backup).unwrap(), 2);

    for _ in 0..3 {
        manager.apply(Command::increment()).await.unwrap();
    }
    assert_eq!(manager.counter().value(), 5);

    assert_eq!(manager.counter().restore(&backup).unwrap(), 2);
    manager.trigger_snapshot().await.unwrap();
    assert_eq!(manager.counter().value(), 2);

    // Commands after a restore continue from the restored value.
    let next = manager.apply(Command::increment()).await.unwrap();
    assert_eq!(next.value, Some(3));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_recovers_state() {
    let dir = tempfile::tempdir().unwrap();

    {
        let manager = leader(dir.path()).await;
        for _ in 0..6 {
            manager.apply(Command::increment()).await.unwrap();
        }
        manager.shutdown().await.unwrap();
    }
    // Let the engine's storage tasks release the sled lock.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let manager = RaftClusterManager::new(config(dir.path())).await.unwrap();
    assert!(manager.has_prior_state());
    manager.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let next = manager.apply(Command::increment()).await.unwrap();
    assert_eq!(next.value, Some(7));

    manager.shutdown().await.unwrap();
}
