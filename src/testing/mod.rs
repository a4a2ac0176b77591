//! Testing utilities and mock implementations
//!
//! Lets code written against [`crate::transport::Transport`] be tested
//! without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
