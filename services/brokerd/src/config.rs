//! Broker daemon configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/skybus/brokerd.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - at least one enabled transport
//!
//! Everything else defaults to the core's documented values.

use serde::Deserialize;
use skybus_core::config::{
    AuthConfig, BrokerConfig, QueueConfig, RetryConfig, TokenCredential, UserCredential,
};
use skybus_transport::mqtt::MqttConfig;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

/// Top-level daemon configuration.
#[derive(Debug, Clone)]
pub struct BrokerdConfig {
    pub schema_version: u32,
    pub broker: BrokerConfig,
    /// Presence snapshot file; None disables persistence.
    pub persistence_path: Option<String>,
    pub transports: TransportsConfig,
}

#[derive(Debug, Clone, Default)]
pub struct TransportsConfig {
    /// TCP listen address, e.g. `0.0.0.0:7800`.
    pub tcp_bind: Option<String>,
    /// WebSocket listen address.
    pub ws_bind: Option<String>,
    /// Serve the process's stdio as one peer.
    pub stdio: bool,
    /// External MQTT broker to bridge devices from.
    pub mqtt: Option<MqttConfig>,
}

impl TransportsConfig {
    fn any_enabled(&self) -> bool {
        self.tcp_bind.is_some() || self.ws_bind.is_some() || self.stdio || self.mqtt.is_some()
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    broker: Option<RawBroker>,
    auth: Option<RawAuth>,
    queue: Option<RawQueue>,
    retry: Option<RawRetry>,
    commands: Option<RawCommands>,
    persistence: Option<RawPersistence>,
    transports: Option<RawTransports>,
}

#[derive(Debug, Deserialize)]
struct RawBroker {
    heartbeat_interval_secs: Option<u64>,
    autosave_interval_secs: Option<u64>,
    session_timeout_minutes: Option<u64>,
    auth_handshake_timeout_secs: Option<u64>,
    drain_grace_secs: Option<u64>,
    pending_response_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawAuth {
    enabled: Option<bool>,
    max_failed_attempts: Option<u32>,
    rate_limit_duration_minutes: Option<u64>,
    users: Option<Vec<RawUser>>,
    tokens: Option<Vec<RawToken>>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawToken {
    name: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQueue {
    soft_limit: Option<usize>,
    hard_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawRetry {
    base_ms: Option<u64>,
    max_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawCommands {
    enable_filtering: Option<bool>,
    allowed: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawPersistence {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTransports {
    tcp: Option<RawBind>,
    websocket: Option<RawBind>,
    stdio: Option<RawStdio>,
    mqtt: Option<RawMqtt>,
}

#[derive(Debug, Deserialize)]
struct RawBind {
    enabled: Option<bool>,
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStdio {
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawMqtt {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load daemon config from the default path `/etc/skybus/brokerd.toml`.
pub fn load_config() -> Result<BrokerdConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/skybus/brokerd.toml"))
}

pub fn load_config_from_path(path: &Path) -> Result<BrokerdConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<BrokerdConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let mut broker = BrokerConfig::default();
    if let Some(b) = raw.broker {
        if let Some(v) = b.heartbeat_interval_secs {
            broker.heartbeat_interval_secs = v;
        }
        if let Some(v) = b.autosave_interval_secs {
            broker.autosave_interval_secs = v;
        }
        if let Some(v) = b.session_timeout_minutes {
            broker.session_timeout_minutes = v;
        }
        if let Some(v) = b.auth_handshake_timeout_secs {
            broker.auth_handshake_timeout_secs = v;
        }
        if let Some(v) = b.drain_grace_secs {
            broker.drain_grace_secs = v;
        }
        if let Some(v) = b.pending_response_timeout_ms {
            broker.pending_response_timeout_ms = v;
        }
    }

    if let Some(a) = raw.auth {
        let mut auth = AuthConfig::default();
        if let Some(v) = a.enabled {
            auth.enabled = v;
        }
        if let Some(v) = a.max_failed_attempts {
            auth.max_failed_attempts = v;
        }
        if let Some(v) = a.rate_limit_duration_minutes {
            auth.rate_limit_duration_minutes = v;
        }
        for (i, user) in a.users.unwrap_or_default().into_iter().enumerate() {
            auth.users.push(UserCredential {
                username: user.username.ok_or_else(|| {
                    ConfigError::MissingField(format!("auth.users[{}].username", i))
                })?,
                password: user.password.ok_or_else(|| {
                    ConfigError::MissingField(format!("auth.users[{}].password", i))
                })?,
            });
        }
        for (i, token) in a.tokens.unwrap_or_default().into_iter().enumerate() {
            auth.tokens.push(TokenCredential {
                name: token
                    .name
                    .ok_or_else(|| ConfigError::MissingField(format!("auth.tokens[{}].name", i)))?,
                token: token.token.ok_or_else(|| {
                    ConfigError::MissingField(format!("auth.tokens[{}].token", i))
                })?,
            });
        }
        broker.auth = auth;
    }

    if let Some(q) = raw.queue {
        let mut queue = QueueConfig::default();
        if let Some(v) = q.soft_limit {
            queue.soft_limit = v;
        }
        if let Some(v) = q.hard_limit {
            queue.hard_limit = v;
        }
        broker.queue = queue;
    }

    if let Some(r) = raw.retry {
        let mut retry = RetryConfig::default();
        if let Some(v) = r.base_ms {
            retry.base = Duration::from_millis(v);
        }
        if let Some(v) = r.max_ms {
            retry.max = Duration::from_millis(v);
        }
        if let Some(v) = r.max_attempts {
            retry.max_attempts = v;
        }
        broker.retry = retry;
    }

    if let Some(c) = raw.commands {
        broker.enable_command_filtering = c.enable_filtering.unwrap_or(false);
        broker.allowed_commands = c
            .allowed
            .unwrap_or_default()
            .into_iter()
            .collect::<HashSet<_>>();
    }

    broker
        .validate()
        .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

    let persistence_path = raw.persistence.and_then(|p| p.path);

    let mut transports = TransportsConfig::default();
    if let Some(t) = raw.transports {
        if let Some(tcp) = t.tcp {
            if tcp.enabled.unwrap_or(true) {
                transports.tcp_bind = Some(
                    tcp.bind
                        .ok_or_else(|| ConfigError::MissingField("transports.tcp.bind".to_owned()))?,
                );
            }
        }
        if let Some(ws) = t.websocket {
            if ws.enabled.unwrap_or(true) {
                transports.ws_bind = Some(ws.bind.ok_or_else(|| {
                    ConfigError::MissingField("transports.websocket.bind".to_owned())
                })?);
            }
        }
        transports.stdio = t.stdio.and_then(|s| s.enabled).unwrap_or(false);
        if let Some(m) = t.mqtt {
            if m.enabled.unwrap_or(false) {
                let host = m
                    .host
                    .ok_or_else(|| ConfigError::MissingField("transports.mqtt.host".to_owned()))?;
                let mut mqtt = MqttConfig::new(host, m.port.unwrap_or(1883));
                if let Some(client_id) = m.client_id {
                    mqtt.client_id = client_id;
                }
                if let (Some(username), Some(password)) = (m.username, m.password) {
                    mqtt.credentials = Some((username, password));
                }
                transports.mqtt = Some(mqtt);
            }
        }
    }
    if !transports.any_enabled() {
        return Err(ConfigError::InvalidValue(
            "at least one transport must be enabled".to_owned(),
        ));
    }

    Ok(BrokerdConfig {
        schema_version,
        broker,
        persistence_path,
        transports,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "I/O error: {}", s),
            ConfigError::Parse(s) => write!(f, "TOML parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
