//! Integration tests for the connection manager against a scripted broker
//!
//! Covers the connect handshake, refusal handling, the retry budget,
//! reconnection after a dropped session and subscription replay.

mod common;

use broker_link::transport::mqtt::{
    CallbackObserver, ConnackCode, ConnectionState, DisconnectReason, ErrorCode, HandlerResult,
    InboundMessage, MqttClient, QoS, ReconnectPolicy,
};
use broker_link::ClientError;
use common::fake_broker::{wait_until, ConnectBehavior, FakeBroker};
use common::{fast_config, SETTLE};
use rumqttc::ConnectReturnCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn noop(_: &InboundMessage) -> HandlerResult {
    Ok(())
}

#[tokio::test]
async fn test_connect_reaches_connected() {
    let broker = FakeBroker::start().await;
    let client = MqttClient::new(fast_config(&broker, Some(3))).unwrap();

    client.connect().await.expect("broker accepts the session");

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(broker.client_ids(), vec![client.client_id().to_string()]);
    assert!(client.client_id().starts_with("brokerlink-"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_bad_credentials_are_not_retried() {
    // Arrange
    let broker = FakeBroker::start().await;
    broker.script([
        ConnectBehavior::Refuse(ConnectReturnCode::BadUserNamePassword),
        ConnectBehavior::Refuse(ConnectReturnCode::BadUserNamePassword),
    ]);
    let client = MqttClient::new(fast_config(&broker, None)).unwrap();

    // Act
    let result = client.connect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Assert
    assert!(matches!(
        result,
        Err(ClientError::Refused(ConnackCode::BadCredentials))
    ));
    assert_eq!(
        client.state(),
        ConnectionState::Error(ErrorCode::Refused(ConnackCode::BadCredentials))
    );
    assert_eq!(broker.connect_count(), 1, "auth refusal must not be retried");
}

#[tokio::test]
async fn test_not_authorized_is_terminal_even_with_unlimited_retries() {
    let broker = FakeBroker::start().await;
    broker.script([ConnectBehavior::Refuse(ConnectReturnCode::NotAuthorized); 3]);
    let client = MqttClient::new(fast_config(&broker, None)).unwrap();

    let result = client.connect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(matches!(
        result,
        Err(ClientError::Refused(ConnackCode::NotAuthorized))
    ));
    assert_eq!(
        client.state(),
        ConnectionState::Error(ErrorCode::Refused(ConnackCode::NotAuthorized))
    );
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(client.stats().reconnect_count, 0);
}

#[tokio::test]
async fn test_retry_budget_exhausted_after_max_attempts() {
    // Arrange: every CONNECT refused with a retryable code
    let broker = FakeBroker::start().await;
    broker.script([ConnectBehavior::Refuse(ConnectReturnCode::ServiceUnavailable); 10]);
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    let client = MqttClient::new(fast_config(&broker, Some(3))).unwrap();
    client.set_observer(CallbackObserver::new().with_on_disconnect(move |reason| {
        sink.lock().unwrap().push(reason.clone());
    }));

    // Act
    let result = client.connect().await;

    // Assert: one initial attempt plus three retries
    assert!(matches!(result, Err(ClientError::RetriesExhausted { attempts: 3 })));
    assert_eq!(client.state(), ConnectionState::Error(ErrorCode::RetriesExhausted));
    assert_eq!(broker.connect_count(), 4);
    assert_eq!(
        *reasons.lock().unwrap(),
        vec![DisconnectReason::RetriesExhausted { attempts: 3 }]
    );
}

#[tokio::test]
async fn test_retry_until_broker_accepts() {
    let broker = FakeBroker::start().await;
    broker.script([
        ConnectBehavior::Refuse(ConnectReturnCode::ServiceUnavailable),
        ConnectBehavior::Refuse(ConnectReturnCode::ServiceUnavailable),
    ]);
    let client = MqttClient::new(fast_config(&broker, Some(5))).unwrap();

    client.connect().await.expect("third attempt is accepted");

    assert_eq!(broker.connect_count(), 3);
    let stats = client.stats();
    assert_eq!(stats.reconnect_count, 2);
    assert_eq!(stats.reconnect_attempts, 0, "streak resets on ConnAck");

    client.disconnect().await;
}

#[tokio::test]
async fn test_disabled_reconnect_ends_disconnected() {
    let broker = FakeBroker::start().await;
    broker.script([ConnectBehavior::Refuse(ConnectReturnCode::ServiceUnavailable)]);
    let mut config = fast_config(&broker, Some(3));
    config.reconnect = ReconnectPolicy::disabled();
    let client = MqttClient::new(config).unwrap();

    let result = client.connect().await;

    assert!(matches!(
        result,
        Err(ClientError::Refused(ConnackCode::ServerUnavailable))
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(broker.connect_count(), 1);
}

#[tokio::test]
async fn test_connect_timeout_keeps_retrying_in_background() {
    let broker = FakeBroker::start().await;
    broker.script([ConnectBehavior::Ignore]);
    let mut config = fast_config(&broker, None);
    config.connect_timeout = Duration::from_millis(300);
    let client = MqttClient::new(config).unwrap();

    let result = client.connect().await;

    assert!(matches!(result, Err(ClientError::Timeout(_))));
    assert_ne!(client.state(), ConnectionState::Disconnected);

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_subscriptions_replayed_after_connection_loss() {
    // Arrange: three filters, one registered before connecting
    let broker = FakeBroker::start().await;
    let connects = Arc::new(Mutex::new(Vec::new()));
    let lost = Arc::new(Mutex::new(Vec::new()));
    let (connect_sink, lost_sink) = (Arc::clone(&connects), Arc::clone(&lost));

    let client = MqttClient::new(fast_config(&broker, Some(5))).unwrap();
    client.set_observer(
        CallbackObserver::new()
            .with_on_connect(move |context| connect_sink.lock().unwrap().push(context.replayed.clone()))
            .with_on_disconnect(move |reason| lost_sink.lock().unwrap().push(reason.clone())),
    );
    client.subscribe("sensors/+/temperature", QoS::AtLeastOnce, noop).unwrap();
    client.connect().await.unwrap();
    client.subscribe("alerts/#", QoS::AtMostOnce, noop).unwrap();
    client.subscribe("status", QoS::AtLeastOnce, noop).unwrap();
    assert!(wait_until(SETTLE, || broker.active_subscriptions().len() == 3).await);

    // Act: broker drops the socket
    broker.drop_connection();
    assert!(wait_until(SETTLE, || broker.connect_count() == 2).await);
    assert!(wait_until(SETTLE, || broker.active_subscriptions().len() == 3).await);

    // Assert: the broker-side set equals the local set
    let mut local: Vec<String> = client
        .subscriptions()
        .into_iter()
        .map(|(pattern, _)| pattern)
        .collect();
    local.sort();
    assert_eq!(broker.active_subscriptions(), local);
    assert_eq!(client.state(), ConnectionState::Connected);

    let replay = broker.subscribe_packets().last().cloned().unwrap();
    assert_eq!(
        replay,
        vec![
            ("sensors/+/temperature".to_string(), 1),
            ("alerts/#".to_string(), 0),
            ("status".to_string(), 1),
        ],
        "one SUBSCRIBE in registration order"
    );
    assert!(wait_until(SETTLE, || connects.lock().unwrap().len() == 2).await);
    assert!(matches!(
        lost.lock().unwrap().first(),
        Some(DisconnectReason::ConnectionLost(_))
    ));
    assert_eq!(client.stats().reconnect_count, 1);

    client.disconnect().await;
}

#[tokio::test]
async fn test_unsubscribe_is_not_replayed() {
    let broker = FakeBroker::start().await;
    let client = MqttClient::new(fast_config(&broker, Some(5))).unwrap();
    client.subscribe("a/#", QoS::AtMostOnce, noop).unwrap();
    client.subscribe("b/#", QoS::AtMostOnce, noop).unwrap();
    client.connect().await.unwrap();
    assert!(wait_until(SETTLE, || broker.active_subscriptions().len() == 2).await);

    client.unsubscribe("a/#").unwrap();
    assert!(wait_until(SETTLE, || broker.unsubscribed() == vec!["a/#".to_string()]).await);
    broker.drop_connection();
    assert!(wait_until(SETTLE, || broker.connect_count() == 2).await);
    assert!(wait_until(SETTLE, || broker.active_subscriptions() == vec!["b/#".to_string()]).await);

    client.disconnect().await;
}

#[tokio::test]
async fn test_broker_gone_exhausts_budget_after_loss() {
    let broker = FakeBroker::start().await;
    let client = MqttClient::new(fast_config(&broker, Some(2))).unwrap();
    client.connect().await.unwrap();
    let mut states = client.state_changes();

    broker.stop();

    let settled = tokio::time::timeout(SETTLE, async {
        loop {
            if matches!(*states.borrow_and_update(), ConnectionState::Error(_)) {
                return;
            }
            states.changed().await.unwrap();
        }
    })
    .await;
    assert!(settled.is_ok(), "client should give up");
    assert_eq!(client.state(), ConnectionState::Error(ErrorCode::RetriesExhausted));

    // disconnect clears the terminal state
    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_sends_disconnect_and_notifies_once() {
    let broker = FakeBroker::start().await;
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    let client = MqttClient::new(fast_config(&broker, Some(3))).unwrap();
    client.set_observer(
        CallbackObserver::new().with_on_disconnect(move |reason| sink.lock().unwrap().push(reason.clone())),
    );
    client.connect().await.unwrap();

    client.disconnect().await;
    client.disconnect().await;

    assert!(wait_until(SETTLE, || broker.graceful_disconnects() == 1).await);
    assert_eq!(*reasons.lock().unwrap(), vec![DisconnectReason::Requested]);
    assert_eq!(broker.connect_count(), 1, "no reconnect after a requested disconnect");
}

#[tokio::test]
async fn test_reconnect_after_disconnect_uses_same_client_id() {
    let broker = FakeBroker::start().await;
    let client = MqttClient::new(fast_config(&broker, Some(3))).unwrap();

    client.connect().await.unwrap();
    client.disconnect().await;
    client.connect().await.unwrap();

    let ids = broker.client_ids();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], ids[1]);

    client.disconnect().await;
}
