//! Transport layer for broker communication
//!
//! This module provides the transport abstraction collaborators depend on
//! and its MQTT implementation.

use crate::transport::mqtt::{ConnectionState, QoS, SubscriptionHandler, SubscriptionId};
use serde::Serialize;
use std::sync::Arc;

pub mod mqtt;

/// Transport trait for publish/subscribe messaging
///
/// This trait provides an abstraction over the broker session so that
/// producers and consumers can be tested without a broker. None of the
/// methods wait on network I/O.
pub trait Transport: Send + Sync {
    type Error: std::error::Error + From<serde_json::Error> + Send + Sync + 'static;

    /// Publish raw bytes to a concrete topic
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
        -> Result<(), Self::Error>;

    /// Publish a value serialized as JSON
    fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error>
    where
        Self: Sized,
    {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload, qos, retain)
    }

    /// Register a handler for a topic pattern
    fn subscribe(
        &self,
        pattern: &str,
        qos: QoS,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionId, Self::Error>;

    /// Remove every handler for a topic pattern
    fn unsubscribe(&self, pattern: &str) -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn state(&self) -> ConnectionState;
}
