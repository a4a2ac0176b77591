//! Shared helpers for integration tests
#![allow(dead_code)]

pub mod fake_broker;

use broker_link::transport::mqtt::{ConnectionConfig, ReconnectPolicy};
use fake_broker::FakeBroker;
use std::time::Duration;

/// Client config pointing at `broker` with a fast fixed backoff
pub fn fast_config(broker: &FakeBroker, max_attempts: Option<u32>) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(broker.host(), broker.port());
    config.connect_timeout = Duration::from_secs(5);
    config.reconnect = ReconnectPolicy {
        enabled: true,
        max_attempts,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(20),
        exponential: false,
    };
    config
}

pub const SETTLE: Duration = Duration::from_secs(5);
