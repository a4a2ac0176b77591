//! Error types for broker-link client operations
//!
//! Configuration problems are reported synchronously, connectivity problems
//! are retried by the supervisor, and only terminal outcomes surface here.

use crate::config::ConfigError;
use crate::transport::mqtt::{ConnackCode, ConnectionState, TopicFilterError};
use std::time::Duration;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("Invalid topic filter: {0}")]
    InvalidFilter(#[from] TopicFilterError),

    #[error("Invalid topic name '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    #[error("Publish packet of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("No subscription registered for pattern: {0}")]
    NotSubscribed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection refused by broker: {0}")]
    Refused(ConnackCode),

    #[error("Reconnection attempts exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("No ConnAck received within {0:?}")]
    Timeout(Duration),

    #[error("Request could not be queued: {0}")]
    Request(#[from] rumqttc::ClientError),

    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// True when retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::NotConnected { state } => !matches!(state, ConnectionState::Error(_)),
            ClientError::ConnectionFailed(_) | ClientError::Timeout(_) => true,
            ClientError::Request(_) => true,
            ClientError::Refused(code) => code.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
