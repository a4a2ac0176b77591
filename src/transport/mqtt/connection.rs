//! Pure connection state management for the MQTT client
//!
//! This module contains the connection state model, the broker parameters
//! a client is built from, and pure functions turning those parameters into
//! rumqttc options.

use super::reconnect::ReconnectPolicy;
use crate::error::ClientError;
use rumqttc::tokio_rustls::rustls;
use rumqttc::{ConnectReturnCode, MqttOptions, QoS, TlsConfiguration, Transport};
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connection state for the MQTT client
///
/// Exactly one state holds at any time. `Error` is terminal until the
/// caller explicitly disconnects or connects again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, also reached after `disconnect()`
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// ConnAck received, ready for operations
    Connected,
    /// Waiting out the backoff delay before the next attempt
    Reconnecting,
    /// Terminal failure
    Error(ErrorCode),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting => f.write_str("reconnecting"),
            ConnectionState::Error(code) => write!(f, "error ({code})"),
        }
    }
}

/// Reason the client entered the terminal `Error` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The reconnect budget ran out
    RetriesExhausted,
    /// The broker refused the session with a non-retryable return code
    Refused(ConnackCode),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::RetriesExhausted => f.write_str("reconnection attempts exhausted"),
            ErrorCode::Refused(code) => write!(f, "refused: {code}"),
        }
    }
}

/// MQTT v3.1.1 CONNACK return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnackCode {
    Accepted,
    BadProtocolVersion,
    BadClientId,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
}

impl ConnackCode {
    pub fn from_return_code(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Success => ConnackCode::Accepted,
            ConnectReturnCode::RefusedProtocolVersion => ConnackCode::BadProtocolVersion,
            ConnectReturnCode::BadClientId => ConnackCode::BadClientId,
            ConnectReturnCode::ServiceUnavailable => ConnackCode::ServerUnavailable,
            ConnectReturnCode::BadUserNamePassword => ConnackCode::BadCredentials,
            ConnectReturnCode::NotAuthorized => ConnackCode::NotAuthorized,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConnackCode::Accepted),
            1 => Some(ConnackCode::BadProtocolVersion),
            2 => Some(ConnackCode::BadClientId),
            3 => Some(ConnackCode::ServerUnavailable),
            4 => Some(ConnackCode::BadCredentials),
            5 => Some(ConnackCode::NotAuthorized),
            _ => None,
        }
    }

    /// Wire value of the return code
    pub fn code(self) -> u8 {
        match self {
            ConnackCode::Accepted => 0,
            ConnackCode::BadProtocolVersion => 1,
            ConnackCode::BadClientId => 2,
            ConnackCode::ServerUnavailable => 3,
            ConnackCode::BadCredentials => 4,
            ConnackCode::NotAuthorized => 5,
        }
    }

    /// Authorization refusals never succeed on retry
    pub fn is_retryable(self) -> bool {
        !matches!(self, ConnackCode::BadCredentials | ConnackCode::NotAuthorized)
    }

    pub fn description(self) -> &'static str {
        match self {
            ConnackCode::Accepted => "connection accepted",
            ConnackCode::BadProtocolVersion => "unacceptable protocol version",
            ConnackCode::BadClientId => "client identifier rejected",
            ConnackCode::ServerUnavailable => "server unavailable",
            ConnackCode::BadCredentials => "bad user name or password",
            ConnackCode::NotAuthorized => "not authorized",
        }
    }
}

impl fmt::Display for ConnackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.description(), self.code())
    }
}

const TAG_DISCONNECTED: u16 = 0;
const TAG_CONNECTING: u16 = 1;
const TAG_CONNECTED: u16 = 2;
const TAG_RECONNECTING: u16 = 3;
const TAG_RETRIES_EXHAUSTED: u16 = 4;
const TAG_REFUSED: u16 = 5;

/// Lock-free cell holding the most recently published `ConnectionState`
///
/// Writers hold the session lock; readers never block.
#[derive(Debug)]
pub struct StateCell(AtomicU16);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU16::new(Self::encode(state)))
    }

    pub fn load(&self) -> ConnectionState {
        Self::decode(self.0.load(Ordering::Acquire))
    }

    /// Store a new state, returning the previous one
    pub fn swap(&self, state: ConnectionState) -> ConnectionState {
        Self::decode(self.0.swap(Self::encode(state), Ordering::AcqRel))
    }

    fn encode(state: ConnectionState) -> u16 {
        match state {
            ConnectionState::Disconnected => TAG_DISCONNECTED << 8,
            ConnectionState::Connecting => TAG_CONNECTING << 8,
            ConnectionState::Connected => TAG_CONNECTED << 8,
            ConnectionState::Reconnecting => TAG_RECONNECTING << 8,
            ConnectionState::Error(ErrorCode::RetriesExhausted) => TAG_RETRIES_EXHAUSTED << 8,
            ConnectionState::Error(ErrorCode::Refused(code)) => {
                (TAG_REFUSED << 8) | u16::from(code.code())
            }
        }
    }

    fn decode(raw: u16) -> ConnectionState {
        match raw >> 8 {
            TAG_CONNECTING => ConnectionState::Connecting,
            TAG_CONNECTED => ConnectionState::Connected,
            TAG_RECONNECTING => ConnectionState::Reconnecting,
            TAG_RETRIES_EXHAUSTED => ConnectionState::Error(ErrorCode::RetriesExhausted),
            TAG_REFUSED => {
                let code = ConnackCode::from_code((raw & 0xff) as u8)
                    .unwrap_or(ConnackCode::NotAuthorized);
                ConnectionState::Error(ErrorCode::Refused(code))
            }
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Broker credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// TLS material for encrypted sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM bundle of trusted CAs; platform roots when absent
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate for mutual TLS
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`
    pub client_key: Option<PathBuf>,
    /// Skip server certificate verification
    pub insecure: bool,
}

/// Immutable broker parameters a client is constructed with
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsSettings>,
    /// Full client identifier sent in CONNECT
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// How long `connect()` waits for the first ConnAck
    pub connect_timeout: Duration,
    /// QoS used by callers that don't pick one explicitly
    pub default_qos: QoS,
    /// Largest packet accepted or sent, in bytes
    pub max_packet_size: usize,
    pub reconnect: ReconnectPolicy,
}

pub const DEFAULT_CLIENT_ID_PREFIX: &str = "brokerlink";
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

impl ConnectionConfig {
    /// Plain TCP session with default policy and a generated client id
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            tls: None,
            client_id: generate_client_id(DEFAULT_CLIENT_ID_PREFIX),
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            default_qos: QoS::AtLeastOnce,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// `host:port` for logs
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Stable prefix plus an 8 hex character random suffix
pub fn generate_client_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}

/// Convert a QoS level number into rumqttc's enum
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Pure function to build rumqttc options from a connection config
pub fn configure_mqtt_options(config: &ConnectionConfig) -> Result<MqttOptions, ClientError> {
    if config.host.is_empty() {
        return Err(ClientError::InvalidBrokerUrl("empty host".to_string()));
    }
    if config.max_packet_size == 0 {
        return Err(ClientError::ConnectionFailed(
            "max packet size must be greater than 0".to_string(),
        ));
    }
    if !config.keep_alive.is_zero() && config.keep_alive < Duration::from_secs(1) {
        return Err(ClientError::ConnectionFailed(format!(
            "keep alive must be at least one second, got {:?}",
            config.keep_alive
        )));
    }

    let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
    mqtt_options.set_keep_alive(config.keep_alive);
    mqtt_options.set_clean_session(config.clean_session);
    mqtt_options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
    mqtt_options.set_request_channel_capacity(REQUEST_CHANNEL_CAPACITY);

    if let Some(credentials) = &config.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    if let Some(tls) = &config.tls {
        mqtt_options.set_transport(build_tls_transport(tls)?);
    }

    Ok(mqtt_options)
}

/// Requests queued between callers and the I/O task
pub const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Build the rumqttc TLS transport from file based settings
pub fn build_tls_transport(tls: &TlsSettings) -> Result<Transport, ClientError> {
    let client_auth = match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => Some((read_file(cert)?, read_file(key)?)),
        (None, None) => None,
        _ => {
            return Err(ClientError::Tls(
                "client_cert and client_key must be configured together".to_string(),
            ))
        }
    };

    if tls.insecure {
        let config = insecure_client_config(client_auth)?;
        return Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(config),
        )));
    }

    match &tls.ca_file {
        Some(ca_file) => Ok(Transport::tls(read_file(ca_file)?, client_auth, None)),
        None if client_auth.is_some() => Err(ClientError::Tls(
            "client certificates require ca_file or insecure mode".to_string(),
        )),
        None => Ok(Transport::tls_with_default_config()),
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path)
        .map_err(|e| ClientError::Tls(format!("Failed to read '{}': {e}", path.display())))
}

fn insecure_client_config(
    client_auth: Option<(Vec<u8>, Vec<u8>)>,
) -> Result<rustls::ClientConfig, ClientError> {
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier));

    match client_auth {
        None => Ok(builder.with_no_client_auth()),
        Some((cert_pem, key_pem)) => {
            let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ClientError::Tls(format!("Failed to parse client cert: {e}")))?;
            let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
                .map_err(|e| ClientError::Tls(format!("Failed to parse client key: {e}")))?
                .ok_or_else(|| ClientError::Tls("No private key found".to_string()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::Tls(format!("Invalid client certificate: {e}")))
        }
    }
}

/// Accepts any server certificate; only reachable with `insecure = true`
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
