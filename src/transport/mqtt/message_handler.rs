//! Message routing and callback contracts for MQTT events
//!
//! [`MessageHandler`] turns raw rumqttc events into routing decisions for
//! the I/O task. The callback traits here are how callers observe the
//! session: [`SubscriptionHandler`] per subscription and
//! [`ConnectionObserver`] for connect and disconnect notifications.

use super::client::SessionContext;
use super::connection::ConnackCode;
use super::dispatch::panic_message;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::{Event, Outgoing, Packet, Publish, QoS, SubscribeReasonCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// Error returned by a subscription handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a subscription handler
pub type HandlerResult = Result<(), HandlerError>;

/// A message received from the broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub received_at: DateTime<Utc>,
    /// The PUBLISH packet as decoded by rumqttc
    pub packet: Publish,
}

impl InboundMessage {
    pub fn from_publish(packet: Publish) -> Self {
        Self {
            topic: packet.topic.clone(),
            payload: packet.payload.clone(),
            qos: packet.qos,
            retain: packet.retain,
            received_at: Utc::now(),
            packet,
        }
    }

    /// Build a QoS 0 message, mainly for tests and injected traffic
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::from_publish(Publish::new(topic.into(), QoS::AtMostOnce, payload))
    }

    /// Payload as UTF-8 text
    pub fn payload_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    /// Decode the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Callback invoked for every inbound message matching a subscription
///
/// Handlers run on the I/O task. They may call `publish`, `subscribe` and
/// `unsubscribe` on a client handle, but should not block for long.
pub trait SubscriptionHandler: Send + Sync {
    fn handle(&self, message: &InboundMessage) -> HandlerResult;
}

impl<F> SubscriptionHandler for F
where
    F: Fn(&InboundMessage) -> HandlerResult + Send + Sync,
{
    fn handle(&self, message: &InboundMessage) -> HandlerResult {
        self(message)
    }
}

/// Why a session ended or could not be established
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called on a connected client
    Requested,
    /// An established session dropped
    ConnectionLost(String),
    /// An attempt failed before ConnAck and reconnection is disabled
    Unreachable(String),
    /// The broker refused the session
    Refused(ConnackCode),
    /// The reconnect budget ran out
    RetriesExhausted { attempts: u32 },
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("disconnect requested"),
            DisconnectReason::ConnectionLost(reason) => write!(f, "connection lost: {reason}"),
            DisconnectReason::Unreachable(reason) => write!(f, "broker unreachable: {reason}"),
            DisconnectReason::Refused(code) => write!(f, "connection refused: {code}"),
            DisconnectReason::RetriesExhausted { attempts } => {
                write!(f, "gave up after {attempts} reconnection attempts")
            }
        }
    }
}

/// Session lifecycle notifications
pub trait ConnectionObserver: Send + Sync {
    /// Called once per successful (re)connect, after subscriptions are replayed
    fn on_connect(&self, _session: &SessionContext) {}

    /// Called when a session ends or the client gives up
    fn on_disconnect(&self, _reason: &DisconnectReason) {}
}

type ConnectCallback = Box<dyn Fn(&SessionContext) + Send + Sync>;
type DisconnectCallback = Box<dyn Fn(&DisconnectReason) + Send + Sync>;

/// Closure based [`ConnectionObserver`]
#[derive(Default)]
pub struct CallbackObserver {
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
}

impl CallbackObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_connect(mut self, callback: impl Fn(&SessionContext) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(callback));
        self
    }

    pub fn with_on_disconnect(
        mut self,
        callback: impl Fn(&DisconnectReason) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Some(Box::new(callback));
        self
    }
}

impl ConnectionObserver for CallbackObserver {
    fn on_connect(&self, session: &SessionContext) {
        if let Some(callback) = &self.on_connect {
            callback(session);
        }
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        if let Some(callback) = &self.on_disconnect {
            callback(reason);
        }
    }
}

/// Run an observer callback, logging instead of unwinding into the caller
pub(crate) fn guard_callback(name: &'static str, callback: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        error!(
            callback = name,
            panic = %panic_message(payload.as_ref()),
            "Connection observer panicked"
        );
    }
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(publish),
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: suback
                        .return_codes
                        .iter()
                        .map(|code| match code {
                            SubscribeReasonCode::Success(qos) => Some(*qos),
                            SubscribeReasonCode::Failure => None,
                        })
                        .collect(),
                },
                Packet::UnsubAck(unsuback) => EventRoute::UnsubscribeConfirmed {
                    packet_id: unsuback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Indices of rejected filters in a SubAck (pure function)
    pub fn rejected_filters(granted: &[Option<QoS>]) -> Vec<usize> {
        granted
            .iter()
            .enumerate()
            .filter(|(_, qos)| qos.is_none())
            .map(|(index, _)| index)
            .collect()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged { session_present: bool },
    /// Message received on subscribed topic
    MessageReceived(Publish),
    /// Broker closed the session
    Disconnected,
    /// Subscription confirmed; `None` marks a rejected filter
    SubscriptionConfirmed {
        packet_id: u16,
        granted: Vec<Option<QoS>>,
    },
    UnsubscribeConfirmed { packet_id: u16 },
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Our DISCONNECT packet has been written
    DisconnectSent,
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
