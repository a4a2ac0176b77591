//! Observability for broker-link
//!
//! Structured logging setup and span macros. Session statistics live with
//! the client in [`crate::transport::mqtt::health_monitor`].

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{operation_span, session_span};
