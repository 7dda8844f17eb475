//! End to end tests for the control server
//!
//! A coordinator connects over TCP, builds a snapshot and asks the server to
//! push it to a fake replica, then checks the replies and the bookkeeping.


use std::time::Duration;
use test_helper::{closed_port, connect, next_reply, request, spawn_replica, start_server};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_resync_over_control_link() {
    let (addr, _state) = start_server(false).await;
    let mut coordinator = connect(addr);

    for i in 0..50 {
        let key = format!("key_{:03}", i);
        let value = format!("value_{}", i);
        assert_eq!(request(&mut coordinator, &["set", &key, &value]), ["ok", "1"]);
    }
    assert_eq!(request(&mut coordinator, &["rr_make_snapshot"]), ["ok"]);

    // Written after the snapshot, must not reach the replica
    request(&mut coordinator, &["set", "zzz_late", "x"]);

    let (port, replica) = spawn_replica();
    let port = port.to_string();
    assert_eq!(
        request(&mut coordinator, &["rr_transfer_snapshot", "127.0.0.1", &port]),
        ["ok", "50"]
    );

    let pairs = replica.join().unwrap();
    assert_eq!(pairs.len(), 50);
    assert_eq!(&pairs[0].0[..], b"key_000");
    assert_eq!(&pairs[49].1[..], b"value_49");

    assert_eq!(
        request(&mut coordinator, &["rr_replic_info"]),
        ["ok", "end", "1", "1", "0", "yes"]
    );
    assert_eq!(request(&mut coordinator, &["ping"]), ["ok"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_without_snapshot_replies_error() {
    let (addr, _state) = start_server(false).await;
    let mut coordinator = connect(addr);

    assert_eq!(
        request(&mut coordinator, &["rr_transfer_snapshot", "127.0.0.1", "1"]),
        ["error", "rr_transfer_snapshot error"]
    );
    assert_eq!(
        request(&mut coordinator, &["rr_replic_info"]),
        ["ok", "end", "0", "0", "0", "no"]
    );
    assert_eq!(request(&mut coordinator, &["ping"]), ["ok"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_to_unreachable_replica() {
    let (addr, _state) = start_server(false).await;
    let mut coordinator = connect(addr);

    request(&mut coordinator, &["set", "a", "1"]);
    request(&mut coordinator, &["rr_make_snapshot"]);

    let port = closed_port().to_string();
    assert_eq!(
        request(&mut coordinator, &["rr_transfer_snapshot", "127.0.0.1", &port]),
        ["error", "rr_transfer_snapshot error"]
    );
    assert_eq!(
        request(&mut coordinator, &["rr_replic_info"]),
        ["ok", "end", "0", "1", "1", "yes"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_append_reply_after_error() {
    let (addr, _state) = start_server(true).await;
    let mut coordinator = connect(addr);

    assert_eq!(
        request(&mut coordinator, &["rr_transfer_snapshot", "127.0.0.1", "1"]),
        ["error", "rr_transfer_snapshot error"]
    );
    assert_eq!(next_reply(&mut coordinator), ["check", "0"]);
    assert_eq!(request(&mut coordinator, &["ping"]), ["ok"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bad_requests() {
    let (addr, _state) = start_server(false).await;
    let mut coordinator = connect(addr);

    assert_eq!(
        request(&mut coordinator, &["flushall"]),
        ["client_error", "Unknown Command: flushall"]
    );
    assert_eq!(
        request(&mut coordinator, &["rr_transfer_snapshot", "127.0.0.1", "port"]),
        ["client_error", "invalid port \"port\""]
    );
    assert_eq!(request(&mut coordinator, &["get", "missing"]), ["not_found"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_closes_idle_sessions() {
    let (addr, state) = start_server(false).await;
    let mut coordinator = connect(addr);
    assert_eq!(request(&mut coordinator, &["ping"]), ["ok"]);

    state.shutdown();
    coordinator
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(coordinator.read().unwrap(), 0);
    assert!(state.pool.is_closed());
}
