//! Configuration system for broker-link
//!
//! A TOML file with three sections:
//!
//! ```toml
//! [broker]
//! broker_url = "mqtts://broker.example.com"
//! username_env = "MQTT_USERNAME"
//! password_env = "MQTT_PASSWORD"
//! client_id_prefix = "stockbot"
//!
//! [tls]
//! ca_file = "/etc/ssl/broker-ca.pem"
//!
//! [reconnect]
//! max_attempts = 10
//! base_delay_ms = 5000
//! ```
//!
//! Only `broker.broker_url` is required. Credentials named through
//! environment variables are resolved by [`ClientConfig::resolve`], not at
//! load time.

use crate::transport::mqtt::{
    generate_client_id, qos_from_level, ConnectionConfig, Credentials, ReconnectPolicy,
    TlsSettings,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main client configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub broker: BrokerSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSection>,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `mqtt://host[:port]` or `mqtts://host[:port]`
    pub broker_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Environment variable containing username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    /// Environment variable containing password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// Stable part of the client id; a random suffix is appended per client
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Keepalive interval in seconds (default: 60, 0 disables)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// How long `connect()` waits for ConnAck (default: 10)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// QoS level used when none is given (default: 1)
    #[serde(default = "default_qos")]
    pub default_qos: u8,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Largest packet accepted or sent, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

/// TLS section; its presence enables TLS unless `enabled = false`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,
    /// Skip server certificate verification (testing only)
    #[serde(default)]
    pub insecure: bool,
}

/// Reconnect section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Attempts per failure streak (default: 10), ignored when `unlimited`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub unlimited: bool,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential: bool,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            unlimited: false,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential: true,
        }
    }
}

impl ReconnectSection {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: self.enabled,
            max_attempts: (!self.unlimited).then_some(self.max_attempts),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            exponential: self.exponential,
        }
    }
}

fn default_client_id_prefix() -> String {
    crate::transport::mqtt::connection::DEFAULT_CLIENT_ID_PREFIX.to_string()
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_qos() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_packet_size() -> usize {
    crate::transport::mqtt::connection::DEFAULT_MAX_PACKET_SIZE
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

/// Shortest keepalive accepted, unless keepalive is disabled with 0
const MIN_KEEPALIVE_SECS: u64 = 5;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Host, port and transport security parsed from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://` / `mqtts://` URLs; ports default to 1883 / 8883
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, ConfigError> {
    let url =
        Url::parse(broker_url).map_err(|e| ConfigError::InvalidBrokerUrl(format!("{broker_url}: {e}")))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "{broker_url}: unsupported scheme '{other}'"
            )))
        }
    };
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ConfigError::InvalidBrokerUrl(format!("{broker_url}: missing host")))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

impl ClientConfig {
    /// Minimal configuration for a broker URL with every default applied
    pub fn for_broker(broker_url: impl Into<String>) -> Self {
        Self {
            broker: BrokerSection {
                broker_url: broker_url.into(),
                username: None,
                password: None,
                username_env: None,
                password_env: None,
                client_id_prefix: default_client_id_prefix(),
                keepalive_secs: default_keepalive_secs(),
                connect_timeout_secs: default_connect_timeout_secs(),
                default_qos: default_qos(),
                clean_session: true,
                max_packet_size: default_max_packet_size(),
            },
            tls: None,
            reconnect: ReconnectSection::default(),
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without the environment
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_broker_url(&self.broker.broker_url)?;

        if self.broker.client_id_prefix.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client_id_prefix must not be empty".to_string(),
            ));
        }
        let keepalive = self.broker.keepalive_secs;
        if keepalive != 0 && keepalive < MIN_KEEPALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "keepalive_secs must be 0 or at least {MIN_KEEPALIVE_SECS}, got {keepalive}"
            )));
        }
        if self.broker.max_packet_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_packet_size must be greater than 0".to_string(),
            ));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if qos_from_level(self.broker.default_qos).is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "default_qos must be 0, 1 or 2, got {}",
                self.broker.default_qos
            )));
        }

        let has_username = self.broker.username.is_some() || self.broker.username_env.is_some();
        let has_password = self.broker.password.is_some() || self.broker.password_env.is_some();
        if has_username && !has_password {
            return Err(ConfigError::InvalidConfig(
                "a username is configured but no password or password_env".to_string(),
            ));
        }

        if let Some(tls) = &self.tls {
            if tls.client_cert.is_some() != tls.client_key.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "tls.client_cert and tls.client_key must be set together".to_string(),
                ));
            }
        }

        self.reconnect
            .policy()
            .validate()
            .map_err(ConfigError::InvalidConfig)
    }

    /// Get an environment variable, failing when it is unset
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Literal credentials, or the values of the named environment variables
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let username = match (&self.broker.username, &self.broker.username_env) {
            (Some(username), _) => Some(username.clone()),
            (None, Some(env)) => Some(Self::get_env_var_required(env)?),
            (None, None) => None,
        };
        let Some(username) = username else {
            return Ok(None);
        };

        let password = match (&self.broker.password, &self.broker.password_env) {
            (Some(password), _) => password.clone(),
            (None, Some(env)) => Self::get_env_var_required(env)?,
            (None, None) => {
                return Err(ConfigError::InvalidConfig(format!(
                    "no password configured for user '{username}'"
                )))
            }
        };
        Ok(Some(Credentials::new(username, password)))
    }

    fn tls_settings(&self, endpoint: &BrokerEndpoint) -> Option<TlsSettings> {
        match &self.tls {
            Some(tls) if tls.enabled || endpoint.tls => Some(TlsSettings {
                ca_file: tls.ca_file.clone(),
                client_cert: tls.client_cert.clone(),
                client_key: tls.client_key.clone(),
                insecure: tls.insecure,
            }),
            Some(_) | None if endpoint.tls => Some(TlsSettings::default()),
            _ => None,
        }
    }

    /// Build the immutable connection parameters, generating a fresh client id
    pub fn resolve(&self) -> Result<ConnectionConfig, ConfigError> {
        self.validate()?;
        let endpoint = parse_broker_url(&self.broker.broker_url)?;
        let default_qos = qos_from_level(self.broker.default_qos).ok_or_else(|| {
            ConfigError::InvalidConfig(format!("invalid default_qos {}", self.broker.default_qos))
        })?;

        let mut config = ConnectionConfig::new(endpoint.host.clone(), endpoint.port);
        config.credentials = self.credentials()?;
        config.tls = self.tls_settings(&endpoint);
        config.client_id = generate_client_id(&self.broker.client_id_prefix);
        config.keep_alive = Duration::from_secs(self.broker.keepalive_secs);
        config.connect_timeout = Duration::from_secs(self.broker.connect_timeout_secs);
        config.clean_session = self.broker.clean_session;
        config.default_qos = default_qos;
        config.max_packet_size = self.broker.max_packet_size;
        config.reconnect = self.reconnect.policy();
        Ok(config)
    }

    /// Copy safe to print: literal passwords are masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.broker.password.is_some() {
            copy.broker.password = Some("***".to_string());
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::QoS;
    use std::io::Write;

    #[test]
    fn test_minimal_config_uses_defaults() {
        // Arrange
        let toml_content = r#"
[broker]
broker_url = "mqtt://localhost"
"#;

        // Act
        let config = ClientConfig::from_toml_str(toml_content).unwrap();

        // Assert
        assert_eq!(config.broker.keepalive_secs, 60);
        assert_eq!(config.broker.default_qos, 1);
        assert_eq!(config.broker.client_id_prefix, "brokerlink");
        assert!(config.tls.is_none());
        assert_eq!(config.reconnect, ReconnectSection::default());
        assert_eq!(config.reconnect.policy(), ReconnectPolicy::default());
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
broker_url = "mqtts://broker.example.com:8884"
username = "bot"
password = "secret"
client_id_prefix = "stockbot"
keepalive_secs = 30
default_qos = 2

[tls]
ca_file = "/etc/ssl/ca.pem"

[reconnect]
unlimited = true
base_delay_ms = 250
max_delay_ms = 4000
exponential = false
"#;

        let config = ClientConfig::from_toml_str(toml_content).unwrap();
        let resolved = config.resolve().unwrap();

        assert_eq!(resolved.host, "broker.example.com");
        assert_eq!(resolved.port, 8884);
        assert_eq!(resolved.keep_alive, Duration::from_secs(30));
        assert_eq!(resolved.default_qos, QoS::ExactlyOnce);
        assert!(resolved.client_id.starts_with("stockbot-"));
        assert_eq!(resolved.credentials, Some(Credentials::new("bot", "secret")));
        assert_eq!(
            resolved.tls.unwrap().ca_file,
            Some(PathBuf::from("/etc/ssl/ca.pem"))
        );
        assert_eq!(resolved.reconnect.max_attempts, None);
        assert!(!resolved.reconnect.exponential);
    }

    #[test]
    fn test_parse_broker_url_default_ports() {
        assert_eq!(
            parse_broker_url("mqtt://localhost").unwrap(),
            BrokerEndpoint {
                host: "localhost".to_string(),
                port: 1883,
                tls: false
            }
        );
        assert_eq!(
            parse_broker_url("mqtts://broker.example.com").unwrap(),
            BrokerEndpoint {
                host: "broker.example.com".to_string(),
                port: 8883,
                tls: true
            }
        );
        assert_eq!(parse_broker_url("mqtt://10.0.0.5:1884").unwrap().port, 1884);
    }

    #[test]
    fn test_parse_broker_url_rejects_bad_input() {
        assert!(matches!(
            parse_broker_url("not a url"),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            parse_broker_url("http://localhost"),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_mqtts_implies_tls_without_section() {
        let config = ClientConfig::for_broker("mqtts://broker.example.com");
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.tls, Some(TlsSettings::default()));

        let plain = ClientConfig::for_broker("mqtt://broker.example.com");
        assert_eq!(plain.resolve().unwrap().tls, None);
    }

    #[test]
    fn test_disabled_tls_section_is_ignored_for_plain_urls() {
        let mut config = ClientConfig::for_broker("mqtt://localhost");
        config.tls = Some(TlsSection {
            enabled: false,
            ca_file: None,
            client_cert: None,
            client_key: None,
            insecure: true,
        });

        assert_eq!(config.resolve().unwrap().tls, None);
    }

    #[test]
    fn test_username_without_password_is_rejected() {
        let mut config = ClientConfig::for_broker("mqtt://localhost");
        config.broker.username = Some("bot".to_string());

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_credentials_from_environment() {
        // Arrange: Unique names so parallel tests don't collide
        std::env::set_var("BROKERLINK_TEST_CFG_USER", "env-bot");
        std::env::set_var("BROKERLINK_TEST_CFG_PASS", "env-secret");
        let mut config = ClientConfig::for_broker("mqtt://localhost");
        config.broker.username_env = Some("BROKERLINK_TEST_CFG_USER".to_string());
        config.broker.password_env = Some("BROKERLINK_TEST_CFG_PASS".to_string());

        // Act
        let credentials = config.credentials().unwrap();

        // Assert
        assert_eq!(credentials, Some(Credentials::new("env-bot", "env-secret")));
    }

    #[test]
    fn test_missing_credential_env_var() {
        let mut config = ClientConfig::for_broker("mqtt://localhost");
        config.broker.username_env = Some("BROKERLINK_TEST_CFG_UNSET_USER".to_string());
        config.broker.password = Some("secret".to_string());

        let result = config.resolve();

        assert!(
            matches!(result, Err(ConfigError::EnvVarNotFound(ref name)) if name == "BROKERLINK_TEST_CFG_UNSET_USER")
        );
    }

    type Mutation = fn(&mut ClientConfig);

    fn case(name: &'static str, mutate: Mutation) -> (&'static str, Mutation) {
        (name, mutate)
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = vec![
            case("short keepalive", |c| c.broker.keepalive_secs = 2),
            case("qos 3", |c| c.broker.default_qos = 3),
            case("zero timeout", |c| c.broker.connect_timeout_secs = 0),
            case("zero packet size", |c| c.broker.max_packet_size = 0),
            case("zero attempts", |c| c.reconnect.max_attempts = 0),
            case("zero base delay", |c| c.reconnect.base_delay_ms = 0),
            case("inverted delays", |c| {
                c.reconnect.base_delay_ms = 10_000;
                c.reconnect.max_delay_ms = 1_000;
            }),
            case("empty prefix", |c| c.broker.client_id_prefix.clear()),
            case("cert without key", |c| {
                c.tls = Some(TlsSection {
                    enabled: true,
                    ca_file: None,
                    client_cert: Some(PathBuf::from("cert.pem")),
                    client_key: None,
                    insecure: false,
                })
            }),
        ];

        for (name, mutate) in cases {
            let mut config = ClientConfig::for_broker("mqtt://localhost");
            mutate(&mut config);
            assert!(config.validate().is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn test_keepalive_zero_is_allowed() {
        let mut config = ClientConfig::for_broker("mqtt://localhost");
        config.broker.keepalive_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unlimited_attempts_ignore_max_attempts() {
        let mut config = ClientConfig::for_broker("mqtt://localhost");
        config.reconnect.unlimited = true;
        config.reconnect.max_attempts = 0;

        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect.policy().max_attempts, None);
    }

    #[test]
    fn test_each_resolve_generates_new_client_id() {
        let config = ClientConfig::for_broker("mqtt://localhost");
        assert_ne!(
            config.resolve().unwrap().client_id,
            config.resolve().unwrap().client_id
        );
    }

    #[test]
    fn test_redacted_masks_password() {
        let mut config = ClientConfig::for_broker("mqtt://localhost");
        config.broker.username = Some("bot".to_string());
        config.broker.password = Some("hunter2".to_string());

        let shown = toml::to_string(&config.redacted()).unwrap();

        assert!(shown.contains("bot"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_load_from_file() {
        // Arrange
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[broker]
broker_url = "mqtt://localhost:1883"

[reconnect]
max_attempts = 3
"#
        )
        .unwrap();

        // Act
        let config = ClientConfig::load_from_file(file.path()).unwrap();

        // Assert
        assert_eq!(config.reconnect.max_attempts, 3);
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = ClientConfig::load_from_file(Path::new("/nonexistent/brokerlink.toml"));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_invalid_toml() {
        let result = ClientConfig::from_toml_str("[broker\nbroker_url = ");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }
}
