//! broker-link - a resilient MQTT v3.1.1 client
//!
//! # Overview
//!
//! This crate wraps [`rumqttc`] with the pieces long-running bots keep
//! rewriting on top of it:
//! - a connection manager with an observable state machine
//! - a reconnection policy engine (bounded or unbounded, fixed or exponential)
//! - a topic dispatch registry with `+` / `#` wildcard matching
//! - subscription replay after every reconnect
//! - TOML configuration, one-shot publish and connection diagnosis
//!
//! # Quick Start
//!
//! ```rust
//! use broker_link::config::ClientConfig;
//! use broker_link::transport::mqtt::TopicFilter;
//!
//! let config = ClientConfig::from_toml_str(
//!     r#"
//!     [broker]
//!     broker_url = "mqtt://localhost:1883"
//!
//!     [reconnect]
//!     max_attempts = 3
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.reconnect.max_attempts, 3);
//!
//! let filter = TopicFilter::parse("sensors/+/temperature").unwrap();
//! assert!(filter.matches("sensors/kitchen/temperature"));
//! ```

pub mod config;
pub mod diagnose;
pub mod error;
pub mod monitor;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use diagnose::{diagnose, publish_once, Diagnosis, DiagnosisOutcome};
pub use error::{ClientError, ClientResult};
pub use transport::mqtt::{
    ClientHandle, ConnectionConfig, ConnectionState, InboundMessage, MqttClient, QoS,
    ReconnectPolicy,
};
pub use transport::Transport;
