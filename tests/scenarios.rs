//! Scenario tests for the per-gateway connection state machine, run against
//! a `MockTransport` instead of a live socket (`SPEC_FULL.md` §2.4). Each
//! test corresponds to one of the concrete scenarios in `spec.md` §8.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_client::config::ClientConfig;
use gateway_client::connection::{Connection, ConnectionState, GatewayRecord};
use gateway_client::error::GatewayError;
use gateway_client::transport::{MockTransport, MockTransportHandle, Transport, TransportFactory};
use gateway_client::{Manager, Reading};
use serde_json::json;
use tokio::sync::mpsc;

/// Spawn a `Connection` whose transport attempts are backed by fresh
/// `MockTransport` pairs, one per `connect()` attempt (so reconnection tests
/// see a new mock socket each time). The returned receiver yields one
/// `MockTransportHandle` per attempt, in order.
fn spawn_mock(record: GatewayRecord, config: ClientConfig) -> (Connection, mpsc::UnboundedReceiver<MockTransportHandle>) {
    let (handle_tx, handle_rx) = mpsc::unbounded_channel();
    let factory: TransportFactory = Arc::new(move |_url: String| {
        let handle_tx = handle_tx.clone();
        Box::pin(async move {
            let (transport, handle) = MockTransport::pair();
            let _ = handle_tx.send(handle);
            Ok(Box::new(transport) as Box<dyn Transport>)
        })
    });
    let connection = Connection::spawn_with_transport(record, config, factory);
    (connection, handle_rx)
}

fn gateway(id: &str) -> GatewayRecord {
    GatewayRecord { id: id.into(), url: "ws://mock/ws".into(), username: "op".into(), password: "hunter2".into(), name: None }
}

/// Drive a fresh mock connection through a successful login handshake,
/// returning the handle to its (only) mock transport.
async fn authenticate(connection: &Connection, handles: &mut mpsc::UnboundedReceiver<MockTransportHandle>) -> MockTransportHandle {
    let connect_task = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.connect().await })
    };
    let mut handle = handles.recv().await.expect("transport opened");
    let login_frame = handle.next_sent_json().await.expect("POST_LOGIN sent");
    assert_eq!(login_frame["Type"], "POST_LOGIN");
    handle.send_json(json!({"Type": "RTN_LOGIN", "Target": "UI", "Data": {"Success": true}}));
    connect_task.await.unwrap().expect("login succeeds");
    let sub_changes = handle.next_sent_json().await.expect("POST_SUB_CHANGES sent after login");
    assert_eq!(sub_changes["Type"], "POST_SUB_CHANGES");
    handle
}

// S1 — happy path login.
#[tokio::test]
async fn s1_happy_path_login() {
    let (connection, mut handles) = spawn_mock(gateway("gw-1"), ClientConfig::default());
    let _handle = authenticate(&connection, &mut handles).await;
    assert_eq!(connection.state(), ConnectionState::Authenticated);
}

// S2 — take battery reading.
#[tokio::test]
async fn s2_take_battery_reading() {
    let (connection, mut handles) = spawn_mock(gateway("gw-1"), ClientConfig::default());
    let handle = authenticate(&connection, &mut handles).await;

    let reading_task = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.take_battery_reading(1234).await })
    };

    let take_frame = handle.next_sent_json().await.expect("TAKE_DYN_BATT sent");
    assert_eq!(take_frame["Type"], "TAKE_DYN_BATT");
    assert_eq!(take_frame["Data"]["DynSerial"], 1234);

    handle.send_json(json!({"Type": "RTN_TAKE_DYN_BATT", "Target": "UI", "Data": {}}));
    handle.send_json(json!({
        "Type": "NOT_DYN_BATT",
        "Target": "UI",
        "Data": {"ID": 7, "Serial": "1234", "Batt": 87, "Time": "2025-01-01T00:00:00Z"},
    }));

    let reading = reading_task.await.unwrap().expect("reading resolves");
    match reading {
        Reading::Battery(r) => {
            assert_eq!(r.id, 7);
            assert_eq!(r.percent, 87);
        }
        other => panic!("unexpected reading: {other:?}"),
    }

    let cached = connection.battery_readings();
    assert_eq!(cached.first().map(|r| r.id), Some(7));
}

// S3 — reading timeout: neither RTN_* nor NOT_DYN_TEMP ever arrives.
#[tokio::test]
async fn s3_reading_timeout() {
    let mut config = ClientConfig::default();
    config.reading_timeout_ms = 30; // short timeout so the test doesn't wait 30s
    let (connection, mut handles) = spawn_mock(gateway("gw-1"), config);
    let _handle = authenticate(&connection, &mut handles).await;

    let result = connection.take_temperature_reading(9999).await;
    assert!(matches!(result, Err(GatewayError::ReadingTimeout(9999))));
    assert_eq!(connection.state(), ConnectionState::Authenticated);
}

// S4 — unclean close triggers reconnection with exponential backoff, up to
// the configured attempt cap.
#[tokio::test]
async fn s4_unclean_close_triggers_reconnect() {
    let mut config = ClientConfig::default();
    config.initial_reconnect_delay_ms = 5;
    config.max_reconnect_delay_ms = 20;
    config.max_reconnect_attempts = 3;
    let (connection, mut handles) = spawn_mock(gateway("gw-1"), config);
    let handle = authenticate(&connection, &mut handles).await;

    handle.close_with_code(Some(1006));

    // Every subsequent attempt gets its own mock transport; authenticate
    // again against the next one to prove a reconnect actually happened.
    let mut handle2 = handles.recv().await.expect("reconnect opened a new transport");
    let login_frame = handle2.next_sent_json().await.expect("POST_LOGIN resent on reconnect");
    assert_eq!(login_frame["Type"], "POST_LOGIN");
    handle2.send_json(json!({"Type": "RTN_LOGIN", "Target": "UI", "Data": {"Success": true}}));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connection.state(), ConnectionState::Authenticated);
}

// S4c — a gateway that stays unreachable through every reconnect dial still
// gets up to maxReconnectAttempts tries (not just one) before going FAILED.
// Regression test: an earlier version treated a failed dial fired by the
// reconnect schedule the same as an explicit connect() failure and gave up
// after the very first attempt.
#[tokio::test]
async fn s4c_failed_redials_are_retried_up_to_the_attempt_cap() {
    let mut config = ClientConfig::default();
    config.initial_reconnect_delay_ms = 5;
    config.max_reconnect_delay_ms = 10;
    config.max_reconnect_attempts = 3;

    let dial_count = Arc::new(AtomicUsize::new(0));
    let (handle_tx, mut handles) = mpsc::unbounded_channel();
    let factory: TransportFactory = {
        let dial_count = dial_count.clone();
        Arc::new(move |_url: String| {
            let dial_count = dial_count.clone();
            let handle_tx = handle_tx.clone();
            Box::pin(async move {
                let attempt = dial_count.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    // Only the very first dial (the initial connect()) succeeds.
                    let (transport, handle) = MockTransport::pair();
                    let _ = handle_tx.send(handle);
                    Ok(Box::new(transport) as Box<dyn Transport>)
                } else {
                    Err(GatewayError::StreamError("gateway unreachable".into()))
                }
            })
        })
    };

    let connection = Connection::spawn_with_transport(gateway("gw-1"), config, factory);
    let handle = authenticate(&connection, &mut handles).await;

    // Drop the only live transport handle without a close frame: the mock's
    // inbound channel closes out from under the actor, which it treats the
    // same as an unclean socket close. Every scheduled redial after this
    // hits the factory's failure branch.
    drop(handle);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(connection.state(), ConnectionState::Failed);
    // 1 initial connect + up to 3 reconnect dials, never more than the cap.
    assert!(dial_count.load(Ordering::SeqCst) >= 4, "expected at least 4 dial attempts, got {}", dial_count.load(Ordering::SeqCst));
    assert!(dial_count.load(Ordering::SeqCst) <= 5, "dial attempts exceeded the attempt cap: {}", dial_count.load(Ordering::SeqCst));
}

// S4b — clean closes (1000, 1001) never arm reconnection.
#[tokio::test]
async fn clean_close_does_not_reconnect() {
    let (connection, mut handles) = spawn_mock(gateway("gw-1"), ClientConfig::default());
    let handle = authenticate(&connection, &mut handles).await;

    handle.close_with_code(Some(1000));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(handles.try_recv().is_err(), "no reconnect attempt should have been made");
}

// S5 — queue survives reconnect: a command issued while DISCONNECTED stays
// pending and is dispatched once connect() succeeds.
#[tokio::test]
async fn s5_queued_command_survives_until_connect() {
    let (connection, mut handles) = spawn_mock(gateway("gw-1"), ClientConfig::default());

    let fetch_task = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.get_connected_sensors().await })
    };

    // The queued GET_DYN_CONNECTED should have kicked off a reconnect attempt
    // on its own, per spec.md §4.2.
    let mut handle = handles.recv().await.expect("queueing while DISCONNECTED triggers a connect attempt");
    let login_frame = handle.next_sent_json().await.expect("POST_LOGIN sent");
    assert_eq!(login_frame["Type"], "POST_LOGIN");
    handle.send_json(json!({"Type": "RTN_LOGIN", "Target": "UI", "Data": {"Success": true}}));

    // Drain POST_SUB_CHANGES, then the queued GET_DYN_CONNECTED should follow
    // once the post-login settle delay elapses.
    let sub_changes = handle.next_sent_json().await.expect("POST_SUB_CHANGES sent");
    assert_eq!(sub_changes["Type"], "POST_SUB_CHANGES");
    let queued = handle.next_sent_json().await.expect("queued GET_DYN_CONNECTED drained after reconnect");
    assert_eq!(queued["Type"], "GET_DYN_CONNECTED");

    handle.send_json(json!({"Type": "RTN_DYN_CONNECTED", "Target": "UI", "Data": {"Dynamizers": []}}));
    let sensors = fetch_task.await.unwrap().expect("queued command eventually resolves");
    assert!(sensors.is_empty());
}

// S6 — debounced Manager-level state: a flap back to CONNECTED within the
// debounce window still publishes only once.
#[tokio::test]
async fn s6_debounced_connected_state() {
    let mut config = ClientConfig::default();
    config.state_debounce_ms = 150;
    let manager = Manager::new(config.clone());
    let (connection, mut handles) = spawn_mock(gateway("gw-1"), config);
    manager.adopt_connection("gw-1", connection.clone());

    let mut sub = manager.subscribe();

    let handle = authenticate(&connection, &mut handles).await;
    drop(handle);

    // AUTHENTICATED publishes immediately; CONNECTED was superseded by it
    // within the same debounce window and should never appear at all.
    let mut saw_connected = false;
    let mut saw_authenticated = false;
    for _ in 0..8 {
        let Ok(Ok(evt)) = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await else { break };
        match evt.event {
            gateway_client::ConnectionEvent::Connected => saw_connected = true,
            gateway_client::ConnectionEvent::Authenticated => {
                saw_authenticated = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_authenticated, "AUTHENTICATED must publish immediately");
    assert!(!saw_connected, "CONNECTED should have been superseded before its debounce window elapsed");
}
