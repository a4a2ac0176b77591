//! Resilient MQTT v3.1.1 client
//!
//! This module separates pure functions from I/O operations for better
//! testability:
//!
//! - [`connection`] - Connection state model and broker parameters
//! - [`reconnect`] - Reconnection policy engine (backoff and retry budget)
//! - [`dispatch`] - Topic filters and the subscription registry
//! - [`message_handler`] - Event routing and callback contracts
//! - [`health_monitor`] - Session statistics and health assessment
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use broker_link::transport::mqtt::{
//!     ConnectionConfig, HandlerResult, InboundMessage, MqttClient, QoS,
//! };
//!
//! # tokio_test::block_on(async {
//! let client = MqttClient::new(ConnectionConfig::new("localhost", 1883))?;
//! client.subscribe("sensors/+/temperature", QoS::AtLeastOnce, |message: &InboundMessage| -> HandlerResult {
//!     println!("{}: {:?}", message.topic, message.payload_str());
//!     Ok(())
//! })?;
//! client.connect().await?;
//! client.publish("sensors/kitchen/temperature", "21.5", QoS::AtLeastOnce, false)?;
//! client.disconnect().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod health_monitor;
pub mod message_handler;
pub mod reconnect;

pub use client::{ClientHandle, MqttClient, SessionContext, SessionFailure};
pub use connection::{
    configure_mqtt_options, generate_client_id, qos_from_level, ConnackCode, ConnectionConfig,
    ConnectionState, Credentials, ErrorCode, TlsSettings,
};
pub use dispatch::{
    validate_topic_name, DispatchReport, SubscriptionId, TopicFilter, TopicFilterError,
    TopicRegistry,
};
pub use health_monitor::{ConnectionQuality, ConnectionStats, HealthMonitor, StatsSnapshot};
pub use message_handler::{
    CallbackObserver, ConnectionObserver, DisconnectReason, EventRoute, HandlerError,
    HandlerResult, InboundMessage, MessageHandler, SubscriptionHandler,
};
pub use reconnect::{ReconnectPolicy, ReconnectionDecision};

pub use rumqttc::QoS;
