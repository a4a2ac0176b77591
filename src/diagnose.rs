//! One-shot broker operations
//!
//! [`publish_once`] for scripts that fire a single message, and
//! [`diagnose`] for checking why a broker refuses us.

use crate::error::{ClientError, ClientResult};
use crate::transport::mqtt::{
    CallbackObserver, ConnackCode, ConnectionConfig, MqttClient, QoS, ReconnectPolicy,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn, Instrument};

/// Connect, publish a single message, disconnect
///
/// The client is disconnected whether or not the publish succeeded.
pub async fn publish_once(
    config: ConnectionConfig,
    topic: &str,
    payload: impl Into<Vec<u8>>,
    qos: QoS,
    retain: bool,
) -> ClientResult<()> {
    let payload = payload.into();
    let span = crate::operation_span!(operation = "publish_once", topic = %topic);

    async move {
        let client = MqttClient::new(config)?;
        let result = match client.connect().await {
            Ok(()) => client.publish(topic, payload, qos, retain),
            Err(e) => Err(e),
        };
        client.disconnect().await;

        match &result {
            Ok(()) => info!("Published one message"),
            Err(e) => warn!(error = %e, "One-shot publish failed"),
        }
        result
    }
    .instrument(span)
    .await
}

/// What happened when we tried to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiagnosisOutcome {
    Accepted {
        session_present: bool,
    },
    Refused {
        code: u8,
        reason: ConnackCode,
        description: &'static str,
        hints: Vec<&'static str>,
    },
    /// TCP or TLS failed before a CONNACK arrived
    Unreachable {
        error: String,
        hints: Vec<&'static str>,
    },
    Timeout {
        after_ms: u64,
    },
}

/// Report produced by [`diagnose`]
#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub broker: String,
    pub client_id: String,
    pub tls: bool,
    pub authenticated: bool,
    pub outcome: DiagnosisOutcome,
    pub elapsed_ms: u64,
}

impl Diagnosis {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, DiagnosisOutcome::Accepted { .. })
    }

    /// One line suitable for a terminal
    pub fn summary(&self) -> String {
        match &self.outcome {
            DiagnosisOutcome::Accepted { session_present } => format!(
                "connected to {} as {} (session present: {})",
                self.broker, self.client_id, session_present
            ),
            DiagnosisOutcome::Refused { code, description, .. } => {
                format!("{} refused the connection (rc={code}): {description}", self.broker)
            }
            DiagnosisOutcome::Unreachable { error, .. } => {
                format!("could not reach {}: {error}", self.broker)
            }
            DiagnosisOutcome::Timeout { after_ms } => {
                format!("no CONNACK from {} within {after_ms}ms", self.broker)
            }
        }
    }

    pub fn hints(&self) -> &[&'static str] {
        match &self.outcome {
            DiagnosisOutcome::Refused { hints, .. } | DiagnosisOutcome::Unreachable { hints, .. } => {
                hints
            }
            _ => &[],
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())?;
        for hint in self.hints() {
            write!(f, "\n  - {hint}")?;
        }
        Ok(())
    }
}

/// Suggestions for a refused CONNECT
pub fn refusal_hints(code: ConnackCode) -> Vec<&'static str> {
    match code {
        ConnackCode::Accepted => Vec::new(),
        ConnackCode::BadProtocolVersion => {
            vec!["the broker does not speak MQTT 3.1.1; check the broker version"]
        }
        ConnackCode::BadClientId => vec![
            "the client id was rejected; try a shorter client_id_prefix",
            "another client may be connected with the same id",
        ],
        ConnackCode::ServerUnavailable => {
            vec!["the broker is up but not accepting sessions; retry later"]
        }
        ConnackCode::BadCredentials => vec![
            "verify the username and password in the broker console",
            "check that username_env / password_env point at the right variables",
            "look for special characters in the password that need escaping",
            "try resetting the password",
        ],
        ConnackCode::NotAuthorized => vec![
            "check the broker ACL for this user",
            "check topic publish/subscribe permissions",
        ],
    }
}

const UNREACHABLE_HINTS: &[&str] = &[
    "check network connectivity",
    "check the broker host and port",
    "check that no firewall blocks the connection",
];

/// Make a single connection attempt and report how the broker answered
///
/// Reconnection is disabled for the attempt. Errors are only returned for
/// problems on our side, like an unreadable CA file.
pub async fn diagnose(mut config: ConnectionConfig) -> ClientResult<Diagnosis> {
    config.reconnect = ReconnectPolicy::disabled();

    let broker = config.broker_address();
    let client_id = config.client_id.clone();
    let tls = config.tls.is_some();
    let authenticated = config.credentials.is_some();
    let span = crate::operation_span!(operation = "diagnose", broker = %broker);

    async move {
        let client = MqttClient::new(config)?;
        let session_present = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&session_present);
        client.set_observer(CallbackObserver::new().with_on_connect(move |context| {
            flag.store(context.session_present, Ordering::SeqCst);
        }));

        let started = Instant::now();
        let result = client.connect().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        client.disconnect().await;

        let outcome = match result {
            Ok(()) => DiagnosisOutcome::Accepted {
                session_present: session_present.load(Ordering::SeqCst),
            },
            Err(ClientError::Refused(code)) => DiagnosisOutcome::Refused {
                code: code.code(),
                reason: code,
                description: code.description(),
                hints: refusal_hints(code),
            },
            Err(ClientError::ConnectionFailed(error)) => DiagnosisOutcome::Unreachable {
                error,
                hints: UNREACHABLE_HINTS.to_vec(),
            },
            Err(ClientError::Timeout(after)) => DiagnosisOutcome::Timeout {
                after_ms: after.as_millis() as u64,
            },
            Err(e) => return Err(e),
        };

        let diagnosis = Diagnosis {
            broker,
            client_id,
            tls,
            authenticated,
            outcome,
            elapsed_ms,
        };
        info!(success = diagnosis.is_success(), "{}", diagnosis.summary());
        Ok(diagnosis)
    }
    .instrument(span)
    .await
}
