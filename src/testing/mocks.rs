//! Mock implementations for testing
//!
//! [`MockTransport`] records publishes and routes injected messages through
//! a real [`TopicRegistry`], so producers and consumers written against
//! [`Transport`] can be tested without a broker.

use crate::error::ClientError;
use crate::transport::mqtt::{
    ConnectionState, DispatchReport, InboundMessage, QoS, SubscriptionHandler, SubscriptionId,
    TopicRegistry,
};
use crate::transport::Transport;
use std::sync::{Arc, Mutex, PoisonError};

/// A message captured by [`MockTransport::publish`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    published: Mutex<Vec<PublishedMessage>>,
    registry: TopicRegistry,
    state: Mutex<ConnectionState>,
    pub should_fail: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            registry: TopicRegistry::new(),
            state: Mutex::new(ConnectionState::Connected),
            should_fail: false,
        }
    }
}

impl MockTransport {
    /// A connected mock
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose publishes fail with `NotConnected`
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Published messages on one topic, payloads decoded as UTF-8
    pub fn published_text(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|message| message.topic == topic)
            .map(|message| String::from_utf8_lossy(&message.payload).into_owned())
            .collect()
    }

    pub fn clear_history(&self) {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Simulate an inbound message from the broker
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> DispatchReport {
        self.registry.dispatch(&InboundMessage::new(topic, payload))
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.registry.filters()
    }
}

impl Transport for MockTransport {
    type Error = ClientError;

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        let state = self.state();
        if self.should_fail || state != ConnectionState::Connected {
            return Err(ClientError::NotConnected { state });
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
        qos: QoS,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionId, Self::Error> {
        Ok(self.registry.register(pattern, qos, handler)?)
    }

    fn unsubscribe(&self, pattern: &str) -> Result<(), Self::Error> {
        match self.registry.remove_pattern(pattern) {
            0 => Err(ClientError::NotSubscribed(pattern.to_string())),
            _ => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
