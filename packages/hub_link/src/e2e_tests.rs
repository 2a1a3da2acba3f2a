//! End-to-end tests: the full subscribe → connect → join → deliver →
//! unsubscribe pipeline against a scripted in-memory session.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::timeout;

use crate::connection::{ConnectionState, HubConnection};
use crate::error::HubError;
use crate::refcount::{RefCounted, RefCountedExt};
use crate::retry::{ExponentialBackoff, FixedDelay};
use crate::subscription::{HubMux, SubscribeOptions};
use crate::test_support::{ScriptedSession, init_test_logging, scripted_config};
use crate::transport::SessionNotification;

/// Ceiling for every await in these tests; virtual time makes it cheap.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, serde::Deserialize)]
struct EchoEvent {
    group: String,
    message: String,
}

/// Poll `condition` until it holds, advancing virtual time between polls.
async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within the polling budget");
}

/// Invocations of `method` whose single argument was the group `name`.
fn group_calls(session: &ScriptedSession, method: &str, name: &str) -> usize {
    session
        .invoke_log()
        .iter()
        .filter(|(m, args)| m == method && args == &vec![Value::String(name.to_string())])
        .count()
}

#[tokio::test(start_paused = true)]
async fn delivers_events_and_tears_down_in_order() {
    init_test_logging();
    let session = ScriptedSession::new();
    let config = Arc::new(scripted_config(&session));
    let mux = HubMux::new();

    let mut sub = mux
        .subscribe(SubscribeOptions::new(config, "notifyMessage").with_group("g1"))
        .await
        .unwrap();

    sub.wait_for_connected().await;
    assert!(sub.connected());
    eventually(|| group_calls(&session, "joinGroup", "g1") == 1).await;

    session.push_event("notifyMessage", json!({"group": "g1neighbouring", "message": "hi"}));
    let payload = timeout(TEST_TIMEOUT, sub.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let event: EchoEvent = serde_json::from_value(payload).unwrap();
    assert_eq!(event.group, "g1neighbouring");
    assert_eq!(event.message, "hi");

    sub.unsubscribe().await;

    assert_eq!(group_calls(&session, "joinGroup", "g1"), 1);
    assert_eq!(group_calls(&session, "leaveGroup", "g1"), 1);
    assert_eq!(session.closes(), 1);
    // the leave went out before the session closed
    let log = session.invoke_log();
    assert_eq!(log.last().map(|(m, _)| m.as_str()), Some("leaveGroup"));
}

#[tokio::test(start_paused = true)]
async fn shared_group_is_left_only_by_its_last_subscriber() {
    init_test_logging();
    let session = ScriptedSession::new();
    let config = Arc::new(scripted_config(&session));
    let mux = HubMux::new();

    let first = mux
        .subscribe(SubscribeOptions::new(config.clone(), "notifyMessage").with_group("g1"))
        .await
        .unwrap();
    let second = mux
        .subscribe(SubscribeOptions::new(config, "notifyMessage").with_group("g1"))
        .await
        .unwrap();

    // both ride the same connection and the same membership
    assert_eq!(mux.connection_count(), 1);
    assert_eq!(session.opens(), 1);

    first.wait_for_connected().await;
    eventually(|| group_calls(&session, "joinGroup", "g1") == 1).await;

    first.unsubscribe().await;
    assert_eq!(group_calls(&session, "leaveGroup", "g1"), 0);
    assert_eq!(session.closes(), 0);

    second.unsubscribe().await;
    assert_eq!(group_calls(&session, "leaveGroup", "g1"), 1);
    assert_eq!(session.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_is_the_terminal_error_for_every_subscriber() {
    init_test_logging();
    let session = ScriptedSession::new();
    let config = Arc::new(scripted_config(&session));
    let mux = HubMux::new();

    let mut first = mux
        .subscribe(SubscribeOptions::new(config.clone(), "notifyMessage"))
        .await
        .unwrap();
    let mut second = mux
        .subscribe(SubscribeOptions::new(config, "notifyMessage"))
        .await
        .unwrap();

    first.wait_for_connected().await;
    session.notify(SessionNotification::Closed(Some("server went away".into())));

    for sub in [&mut first, &mut second] {
        let terminal = timeout(TEST_TIMEOUT, sub.recv()).await.unwrap();
        match terminal {
            Some(Err(HubError::ConnectionLost { reason, .. })) => {
                assert_eq!(reason, "server went away");
            }
            other => panic!("expected a lost-connection terminal, got {other:?}"),
        }
        // exactly one terminal signal, ever
        assert!(timeout(TEST_TIMEOUT, sub.recv()).await.unwrap().is_none());
    }

    // the dead connection drops out of the registry
    eventually(|| mux.connection_count() == 0).await;
}

#[tokio::test(start_paused = true)]
async fn retry_gives_up_carrying_the_last_failure() {
    init_test_logging();
    let session = ScriptedSession::with_open_results(vec![
        Err(HubError::Connect("no route 1".into())),
        Err(HubError::Connect("no route 2".into())),
        Err(HubError::Connect("no route 3".into())),
    ]);
    let config = Arc::new(
        scripted_config(&session)
            .with_retry(FixedDelay::with_max_attempts(Duration::from_millis(500), 3)),
    );

    let connection = HubConnection::new(config);
    connection.add_ref().unwrap();

    let result = timeout(TEST_TIMEOUT, connection.connect_result())
        .await
        .unwrap();
    match result {
        Err(HubError::ConnectionLost { reason, .. }) => {
            assert!(reason.contains("no route 3"), "reason was {reason:?}");
        }
        other => panic!("expected a lost-connection result, got {other:?}"),
    }

    assert_eq!(session.opens(), 3);
    eventually(|| connection.state() == ConnectionState::Disconnected).await;
    assert!(connection.lifecycle().error().is_some());
}

#[tokio::test(start_paused = true)]
async fn retry_success_settles_the_connect_result_once() {
    init_test_logging();
    let session = ScriptedSession::with_open_results(vec![
        Err(HubError::Connect("no route 1".into())),
        Err(HubError::Connect("no route 2".into())),
    ]);
    let config = Arc::new(
        scripted_config(&session)
            .with_retry(FixedDelay::with_max_attempts(Duration::from_millis(500), 3)),
    );

    let connection = HubConnection::new(config);
    connection.add_ref().unwrap();

    timeout(TEST_TIMEOUT, connection.connect_result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.opens(), 3);
    assert_eq!(connection.state(), ConnectionState::Connected);

    // the settled result replays, it is never rewritten
    connection.connect_result().await.unwrap();

    connection.release().await;
    assert_eq!(session.closes(), 1);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn connects_when_the_server_comes_back() {
    init_test_logging();
    let session = ScriptedSession::with_open_results(vec![
        Err(HubError::Connect("refused".into())),
        Err(HubError::Connect("refused".into())),
    ]);
    let config = Arc::new(scripted_config(&session).with_retry(ExponentialBackoff::default()));
    let mux = HubMux::new();

    let sub = mux
        .subscribe(SubscribeOptions::new(config, "notifyMessage").with_group("g1"))
        .await
        .unwrap();
    assert!(!sub.connected());

    timeout(TEST_TIMEOUT, sub.wait_for_connected()).await.unwrap();
    assert!(session.opens() >= 3);
    eventually(|| group_calls(&session, "joinGroup", "g1") == 1).await;

    sub.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn every_group_rejoins_once_after_a_reconnect() {
    init_test_logging();
    let session = ScriptedSession::new();
    let config = Arc::new(scripted_config(&session));
    let mux = HubMux::new();

    let sub = mux
        .subscribe(SubscribeOptions::new(config, "notifyMessage").with_groups(["g1", "g2"]))
        .await
        .unwrap();

    sub.wait_for_connected().await;
    eventually(|| {
        group_calls(&session, "joinGroup", "g1") == 1
            && group_calls(&session, "joinGroup", "g2") == 1
    })
    .await;

    session.notify(SessionNotification::Reconnecting);
    timeout(TEST_TIMEOUT, sub.wait_for_disconnected()).await.unwrap();

    session.notify(SessionNotification::Reconnected);
    timeout(TEST_TIMEOUT, sub.wait_for_connected()).await.unwrap();

    eventually(|| {
        group_calls(&session, "joinGroup", "g1") == 2
            && group_calls(&session, "joinGroup", "g2") == 2
    })
    .await;
    assert_eq!(session.invoked("leaveGroup"), 0);

    sub.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn join_failure_stays_inside_the_group() {
    init_test_logging();
    let session = ScriptedSession::new();
    session.fail_invokes_of("joinGroup");
    let config = Arc::new(scripted_config(&session));
    let mux = HubMux::new();

    let mut sub = mux
        .subscribe(SubscribeOptions::new(config, "notifyMessage").with_group("g1"))
        .await
        .unwrap();

    sub.wait_for_connected().await;
    eventually(|| group_calls(&session, "joinGroup", "g1") == 1).await;

    // the connection survives; events still flow
    session.push_event("notifyMessage", json!({"group": "g1", "message": "still here"}));
    let payload = timeout(TEST_TIMEOUT, sub.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(payload["message"], "still here");

    sub.unsubscribe().await;
    // the errored membership was already gone, so no leave goes out
    assert_eq!(session.invoked("leaveGroup"), 0);
    assert_eq!(session.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn completion_makes_room_for_a_fresh_connection() {
    init_test_logging();
    let session = ScriptedSession::new();
    let config = Arc::new(scripted_config(&session));
    let mux = HubMux::new();

    let sub = mux
        .subscribe(SubscribeOptions::new(config.clone(), "notifyMessage"))
        .await
        .unwrap();
    sub.wait_for_connected().await;
    sub.unsubscribe().await;
    eventually(|| mux.connection_count() == 0).await;

    // same config identity, brand-new connection instance
    let sub = mux
        .subscribe(SubscribeOptions::new(config, "notifyMessage"))
        .await
        .unwrap();
    sub.wait_for_connected().await;
    assert_eq!(session.opens(), 2);
    assert_eq!(mux.connection_count(), 1);
    sub.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_delivers_a_clean_terminal() {
    init_test_logging();
    let session = ScriptedSession::new();
    let config = Arc::new(scripted_config(&session));
    let mux = HubMux::new();

    let mut sub = mux
        .subscribe(SubscribeOptions::new(config, "notifyMessage").with_group("g1"))
        .await
        .unwrap();
    sub.wait_for_connected().await;
    eventually(|| group_calls(&session, "joinGroup", "g1") == 1).await;

    mux.shutdown().await;
    assert_eq!(mux.connection_count(), 0);
    assert_eq!(session.closes(), 1);

    // clean completion: no error item, the stream just ends
    assert!(timeout(TEST_TIMEOUT, sub.recv()).await.unwrap().is_none());

    // tearing down the already-dead subscription is harmless
    sub.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn invoke_passes_through_to_the_session() {
    init_test_logging();
    let session = ScriptedSession::new();
    let config = Arc::new(scripted_config(&session));
    let mux = HubMux::new();

    let sub = mux
        .subscribe(SubscribeOptions::new(config, "notifyMessage"))
        .await
        .unwrap();
    sub.wait_for_connected().await;

    sub.invoke("send", vec![json!("g1"), json!(1), json!("hello")])
        .await
        .unwrap();
    assert_eq!(session.invoked("send"), 1);

    sub.unsubscribe().await;
}
