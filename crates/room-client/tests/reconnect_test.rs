//! Integration tests for signaling loss, reconnects and stale results

mod harness;

use harness::{eventually, fast_reconnect, options, EngineLog, TestRoom};
use serde_json::json;
use sfu_room_client::signaling::protocol::methods;
use sfu_room_client::{ConnectionState, ReconnectPolicy};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_automatic_reconnect_rejoins() {
    let mut room = TestRoom::new(options(fast_reconnect()), true);
    room.server
        .script()
        .set_peers(vec![json!({"id": "bob", "displayName": "Bob"})]);
    let first = room.join().await;
    first
        .request(
            methods::NEW_CONSUMER,
            json!({
                "peerId": "bob",
                "producerId": "bob-mic",
                "id": "c1",
                "kind": "audio",
                "rtpParameters": {}
            }),
        )
        .await
        .result
        .unwrap();

    first.disconnect();

    let log = room.engine.log().clone();
    eventually("media torn down", || {
        EngineLog::get(&log.transports_closed) == 2
            && EngineLog::get(&log.producers_closed) == 2
            && EngineLog::get(&log.consumers_closed) == 1
    })
    .await;
    eventually("disconnect notified", || room.notified("WebSocket disconnected")).await;

    let second = room.server.accept().await;
    room.wait_ready().await;

    let sequence = second.methods();
    assert_eq!(sequence[0], methods::GET_ROUTER_RTP_CAPABILITIES);
    assert_eq!(sequence[1], methods::JOIN);
    assert_eq!(EngineLog::get(&log.loads), 2);
    assert_eq!(EngineLog::get(&log.send_transports), 2);
    assert_eq!(EngineLog::get(&log.recv_transports), 2);

    let snapshot = room.client.snapshot();
    assert!(snapshot.peers.contains_key("bob"));
    assert!(snapshot.consumers.is_empty());
    assert_eq!(room.client.consumer_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_clears_session_state() {
    let mut room = TestRoom::new(options(ReconnectPolicy::Manual), true);
    room.server
        .script()
        .set_peers(vec![json!({"id": "bob", "displayName": "Bob"})]);
    let session = room.join().await;

    session.disconnect();

    eventually("session cleared", || {
        let snapshot = room.client.snapshot();
        snapshot.room.state == ConnectionState::Connecting
            && snapshot.transports.is_empty()
            && snapshot.producers.is_empty()
            && snapshot.peers.is_empty()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_policy_waits_for_join() {
    let mut room = TestRoom::new(options(ReconnectPolicy::Manual), true);
    let session = room.join().await;

    session.disconnect();
    eventually("disconnected", || {
        room.client.snapshot().transports.is_empty()
    })
    .await;

    room.server
        .expect_no_connection(Duration::from_millis(200))
        .await;
    assert_eq!(room.client.connection_state(), ConnectionState::Connecting);

    let _rejoined = room.join().await;
    assert_eq!(EngineLog::get(&room.engine.log().send_transports), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_connect_with_manual_policy() {
    let mut room = TestRoom::new(options(ReconnectPolicy::Manual), true);
    room.connector.fail_next(1);

    room.client.join();
    eventually("connect failure notified", || {
        room.notified("WebSocket connection failed")
    })
    .await;
    assert_eq!(room.client.connection_state(), ConnectionState::Connecting);

    let _session = room.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_automatic_policy_retries_failed_connect() {
    let mut room = TestRoom::new(options(fast_reconnect()), true);
    room.connector.fail_next(2);

    let _session = room.join().await;
    eventually("connect failures notified", || {
        room.notified("WebSocket connection failed")
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_giving_up_closes_room() {
    let policy = ReconnectPolicy::Automatic {
        max_attempts: 2,
        min_delay_ms: 10,
        max_delay_ms: 20,
    };
    let mut room = TestRoom::new(options(policy), true);
    let session = room.join().await;

    room.connector.fail_next(100);
    session.disconnect();

    eventually("room closed", || {
        room.client.connection_state() == ConnectionState::Closed
    })
    .await;
    eventually("channel close notified", || room.notified("Signaling channel closed")).await;
    assert!(room.client.snapshot().transports.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_while_active_is_ignored() {
    let mut room = TestRoom::new(options(ReconnectPolicy::Manual), true);
    let session = room.join().await;

    room.client.join();
    room.server
        .expect_no_connection(Duration::from_millis(150))
        .await;

    assert_eq!(session.count(methods::JOIN), 1);
    assert_eq!(room.client.connection_state(), ConnectionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unanswered_request_is_not_applied_after_reconnect() {
    let mut room = TestRoom::new(options(fast_reconnect()), true);
    let first = room.join().await;

    room.server.script().ignore(methods::CHANGE_DISPLAY_NAME);
    room.client.change_display_name("Ghost");
    eventually("rename sent", || first.count(methods::CHANGE_DISPLAY_NAME) == 1).await;
    first.disconnect();

    let _second = room.server.accept().await;
    room.wait_ready().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(room.client.snapshot().me.display_name, "Alice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_during_join_reconnects() {
    let mut room = TestRoom::new(options(fast_reconnect()), true);
    room.server.script().ignore(methods::JOIN);

    room.client.join();
    let first = room.server.accept().await;
    eventually("join sent", || first.count(methods::JOIN) == 1).await;

    room.server.script().heal(methods::JOIN);
    first.disconnect();

    let second = room.server.accept().await;
    room.wait_ready().await;

    assert_eq!(second.count(methods::JOIN), 1);
    assert_eq!(room.client.connection_state(), ConnectionState::Connected);
    assert!(!room.notified("Could not join the room"));
}
