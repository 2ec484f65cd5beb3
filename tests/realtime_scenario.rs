//! Realtime client against an in-process broker
//!
//! Covers the session lifecycle end to end: pending subscriptions replayed
//! on connect, recovery after the broker drops the socket, terminal
//! credential rejection and credential rotation.

mod common;

use campus_chat::client::stomp::Frame;
use campus_chat::client::{RealtimeClient, TokenStore};
use campus_chat::shared::{
    AppConfig, ConnectionEvent, ConnectionState, ErrorClass, RealtimeError, ReconnectConfig,
};
use common::*;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const TOPIC: &str = "/topic/project/42";
const WAIT: Duration = Duration::from_secs(5);

fn config(broker: &TestBroker) -> AppConfig {
    AppConfig::builder()
        .ws_url(broker.url())
        .settle_delay_ms(10)
        .heartbeat_ms(0, 0)
        .reconnect(ReconnectConfig {
            auto_reconnect: true,
            max_attempts: 10,
            base_delay_ms: 50,
            max_delay_ms: 200,
            max_jitter_ms: 10,
        })
        .build()
        .unwrap()
}

fn collector() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Frame) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |frame: &Frame| {
        sink.lock().unwrap().push(frame.body.clone());
    })
}

async fn next_matching<F>(events: &mut broadcast::Receiver<ConnectionEvent>, mut pick: F) -> Option<ConnectionEvent>
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pick(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn test_pending_subscription_is_replayed_on_connect() {
    let broker = TestBroker::start().await;
    let token = valid_token("ada@example.edu");
    let client = RealtimeClient::spawn(&config(&broker), Arc::new(TokenStore::with_token(token.clone()))).unwrap();
    let mut events = client.events();

    let (seen, handler) = collector();
    assert!(client.subscribe_fn(TOPIC, handler).await.is_none());

    client.connect().await.unwrap();
    assert!(next_matching(&mut events, |e| *e == ConnectionEvent::Connected).await.is_some());
    assert_eq!(client.state(), ConnectionState::Connected);

    assert!(eventually(WAIT, || broker.log().subscribes.len() == 1).await);
    let log = broker.log();
    assert_eq!(log.connects, vec![Some(format!("Bearer {}", token))]);
    assert_eq!(log.subscribes[0].2, TOPIC);

    assert_eq!(broker.publish(TOPIC, &message_body(42, 1)), 1);
    assert!(eventually(WAIT, || seen.lock().unwrap().len() == 1).await);

    client.shutdown().await;
}

#[tokio::test]
async fn test_publish_reaches_broker() {
    let broker = TestBroker::start().await;
    let client = RealtimeClient::spawn(
        &config(&broker),
        Arc::new(TokenStore::with_token(valid_token("ada@example.edu"))),
    )
    .unwrap();

    assert!(!client.publish("/app/chat/42", &serde_json::json!({"content": "early"})).await);

    client.connect().await.unwrap();
    assert!(client.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert!(client.publish("/app/chat/42", &serde_json::json!({"content": "hello"})).await);

    assert!(eventually(WAIT, || broker.log().sends.len() == 1).await);
    let (destination, body) = broker.log().sends[0].clone();
    assert_eq!(destination, "/app/chat/42");
    assert_eq!(body, r#"{"content":"hello"}"#);

    client.shutdown().await;
}

#[tokio::test]
async fn test_subscriptions_survive_broker_drop() {
    let broker = TestBroker::start().await;
    let client = RealtimeClient::spawn(
        &config(&broker),
        Arc::new(TokenStore::with_token(valid_token("ada@example.edu"))),
    )
    .unwrap();
    let mut events = client.events();

    let (seen, handler) = collector();
    client.subscribe_fn(TOPIC, handler).await;
    client.connect().await.unwrap();
    assert!(next_matching(&mut events, |e| *e == ConnectionEvent::Connected).await.is_some());

    broker.drop_connections();

    let retry = next_matching(&mut events, |e| matches!(e, ConnectionEvent::Reconnecting { .. })).await;
    assert!(matches!(retry, Some(ConnectionEvent::Reconnecting { attempt: 1, .. })));
    assert!(next_matching(&mut events, |e| *e == ConnectionEvent::Connected).await.is_some());

    assert!(eventually(WAIT, || broker.log().subscribes.len() == 2).await);
    let log = broker.log();
    assert_eq!(log.connects.len(), 2);
    assert!(log.subscribes.iter().all(|(_, _, destination)| destination == TOPIC));
    assert_ne!(log.subscribes[0].0, log.subscribes[1].0);

    assert!(eventually(WAIT, || broker.subscribers_of(TOPIC) == 1).await);
    broker.publish(TOPIC, &message_body(42, 2));
    assert!(eventually(WAIT, || seen.lock().unwrap().len() == 1).await);

    client.shutdown().await;
}

#[tokio::test]
async fn test_binary_garbage_keeps_session() {
    let broker = TestBroker::start().await;
    let client = RealtimeClient::spawn(
        &config(&broker),
        Arc::new(TokenStore::with_token(valid_token("ada@example.edu"))),
    )
    .unwrap();

    let (seen, handler) = collector();
    client.subscribe_fn(TOPIC, handler).await;
    client.connect().await.unwrap();
    assert!(client.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert!(eventually(WAIT, || broker.subscribers_of(TOPIC) == 1).await);

    broker.push_binary(&[0xff, 0xfe, 0x00]);
    broker.publish(TOPIC, &message_body(42, 1));

    assert!(eventually(WAIT, || seen.lock().unwrap().len() == 1).await);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(broker.log().connects.len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_frames_before_malformed_tail_are_delivered() {
    let broker = TestBroker::start().await;
    let client = RealtimeClient::spawn(
        &config(&broker),
        Arc::new(TokenStore::with_token(valid_token("ada@example.edu"))),
    )
    .unwrap();
    let mut events = client.events();

    let (seen, handler) = collector();
    client.subscribe_fn(TOPIC, handler).await;
    client.connect().await.unwrap();
    assert!(client.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert!(eventually(WAIT, || broker.subscribers_of(TOPIC) == 1).await);

    let body = message_body(42, 3);
    let frame = broker.message_frame(TOPIC, &body).unwrap();
    broker.push_text(&format!("{}BOGUS\n\n\0", frame));

    let error = next_matching(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
    assert!(matches!(error, Some(ConnectionEvent::Error(RealtimeError::Frame(_)))));
    assert!(eventually(WAIT, || seen.lock().unwrap().len() == 1).await);
    assert_eq!(seen.lock().unwrap()[0], body);
    assert_eq!(client.state(), ConnectionState::Connected);

    client.shutdown().await;
}

#[tokio::test]
async fn test_rejected_credential_is_terminal() {
    let broker = TestBroker::start().await;
    broker.reject_connects("Invalid JWT token");
    let client = RealtimeClient::spawn(
        &config(&broker),
        Arc::new(TokenStore::with_token(valid_token("ada@example.edu"))),
    )
    .unwrap();
    let mut events = client.events();

    client.connect().await.unwrap();
    let error = next_matching(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
    match error {
        Some(ConnectionEvent::Error(error)) => {
            assert_eq!(error.class(), ErrorClass::Terminal);
            assert!(error.requires_reauthentication());
        }
        other => panic!("expected an error event, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(broker.log().connects.len(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.shutdown().await;
}

#[tokio::test]
async fn test_transient_broker_error_retries() {
    let broker = TestBroker::start().await;
    broker.reject_connects("Broker is restarting");
    let client = RealtimeClient::spawn(
        &config(&broker),
        Arc::new(TokenStore::with_token(valid_token("ada@example.edu"))),
    )
    .unwrap();
    let mut events = client.events();

    client.connect().await.unwrap();
    let retry = next_matching(&mut events, |e| matches!(e, ConnectionEvent::Reconnecting { .. })).await;
    assert!(retry.is_some());

    broker.accept_connects();
    assert!(client.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert!(broker.log().connects.len() >= 2);

    client.shutdown().await;
}

#[tokio::test]
async fn test_rotation_reconnects_with_new_token() {
    let broker = TestBroker::start().await;
    let first = valid_token("ada@example.edu");
    let second = valid_token("grace@example.edu");
    let tokens = Arc::new(TokenStore::with_token(first.clone()));
    let client = RealtimeClient::spawn_with_rotations(&config(&broker), tokens.clone(), tokens.rotations()).unwrap();

    client.subscribe_fn(TOPIC, |_| {}).await;
    client.connect().await.unwrap();
    assert!(client.wait_for_state(ConnectionState::Connected, WAIT).await);

    tokens.set_token(Some(second.clone()));
    assert!(eventually(WAIT, || broker.log().connects.len() == 2).await);
    assert!(client.wait_for_state(ConnectionState::Connected, WAIT).await);

    assert_eq!(
        broker.log().connects,
        vec![Some(format!("Bearer {}", first)), Some(format!("Bearer {}", second))]
    );
    assert!(eventually(WAIT, || broker.log().disconnects == 1).await);
    assert!(eventually(WAIT, || broker.log().subscribes.len() == 2).await);

    client.shutdown().await;
}

#[tokio::test]
async fn test_logout_disconnects() {
    let broker = TestBroker::start().await;
    let tokens = Arc::new(TokenStore::with_token(valid_token("ada@example.edu")));
    let client = RealtimeClient::spawn_with_rotations(&config(&broker), tokens.clone(), tokens.rotations()).unwrap();

    client.connect().await.unwrap();
    assert!(client.wait_for_state(ConnectionState::Connected, WAIT).await);

    tokens.clear();
    assert!(client.wait_for_state(ConnectionState::Disconnected, WAIT).await);
    assert!(eventually(WAIT, || broker.live_connections() == 0).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.log().connects.len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_then_connect_replays() {
    let broker = TestBroker::start().await;
    let client = RealtimeClient::spawn(
        &config(&broker),
        Arc::new(TokenStore::with_token(valid_token("ada@example.edu"))),
    )
    .unwrap();

    client.subscribe_fn(TOPIC, |_| {}).await;
    client.connect().await.unwrap();
    assert!(client.wait_for_state(ConnectionState::Connected, WAIT).await);

    client.disconnect().await;
    assert!(client.wait_for_state(ConnectionState::Disconnected, WAIT).await);
    assert!(eventually(WAIT, || broker.log().disconnects == 1).await);

    // explicit disconnect does not retry
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.log().connects.len(), 1);

    client.connect().await.unwrap();
    assert!(client.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert!(eventually(WAIT, || broker.log().subscribes.len() == 2).await);
    assert!(eventually(WAIT, || broker.subscribers_of(TOPIC) == 1).await);

    client.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_while_connected() {
    let broker = TestBroker::start().await;
    let client = RealtimeClient::spawn(
        &config(&broker),
        Arc::new(TokenStore::with_token(valid_token("ada@example.edu"))),
    )
    .unwrap();

    client.connect().await.unwrap();
    assert!(client.wait_for_state(ConnectionState::Connected, WAIT).await);

    let handle = client.subscribe_fn(TOPIC, |_| {}).await;
    assert!(handle.is_some());
    assert!(eventually(WAIT, || broker.subscribers_of(TOPIC) == 1).await);

    assert!(client.unsubscribe(TOPIC).await);
    assert!(!client.unsubscribe(TOPIC).await);
    assert!(eventually(WAIT, || broker.subscribers_of(TOPIC) == 0).await);
    assert_eq!(broker.log().unsubscribes.len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_expired_token_never_reaches_broker() {
    let broker = TestBroker::start().await;
    let client = RealtimeClient::spawn(
        &config(&broker),
        Arc::new(TokenStore::with_token(expired_token("ada@example.edu"))),
    )
    .unwrap();

    let err = client.connect().await.unwrap_err();
    assert_eq!(err, RealtimeError::CredentialExpired);
    assert_eq!(err.class(), ErrorClass::Precondition);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(broker.log().connects.is_empty());

    client.shutdown().await;
}
