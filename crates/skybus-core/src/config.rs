//! Broker configuration.
//!
//! These are the code-level options the core consumes, with the documented
//! defaults.  `services/brokerd` maps its TOML file onto this struct; tests
//! construct it directly and override single fields.

use std::collections::HashSet;
use std::time::Duration;

/// Top-level broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Period at which the broker emits keep-alive events; 0 disables.
    pub heartbeat_interval_secs: u64,
    /// Debounce window for registry persistence snapshots.
    pub autosave_interval_secs: u64,
    /// Idle deadline for authenticated sessions; 0 disables the sweep.
    pub session_timeout_minutes: u64,
    /// Deadline for a freshly accepted peer to finish authenticating.
    pub auth_handshake_timeout_secs: u64,
    /// Grace period for draining outbound queues on shutdown.
    pub drain_grace_secs: u64,
    /// Consecutive decode failures tolerated before a session is closed.
    pub max_decode_failures: u32,
    /// Router correlation deadline for pending responses.
    pub pending_response_timeout_ms: u64,
    /// Commands accepted when filtering is on; ignored otherwise.
    pub allowed_commands: HashSet<String>,
    pub enable_command_filtering: bool,
    pub auth: AuthConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            heartbeat_interval_secs: 30,
            autosave_interval_secs: 5,
            session_timeout_minutes: 30,
            auth_handshake_timeout_secs: 10,
            drain_grace_secs: 5,
            max_decode_failures: 5,
            pending_response_timeout_ms: 10_000,
            allowed_commands: HashSet::new(),
            enable_command_filtering: false,
            auth: AuthConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// A config with authentication disabled, for tests and trusted
    /// deployments.
    pub fn open() -> Self {
        let mut cfg = BrokerConfig::default();
        cfg.auth.enabled = false;
        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.retry.validate()?;
        if self.pending_response_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "pending_response_timeout_ms must be non-zero".to_owned(),
            ));
        }
        if self.enable_command_filtering && self.allowed_commands.is_empty() {
            return Err(ConfigError::InvalidValue(
                "command filtering is enabled but allowed_commands is empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A `user:pass` credential for the basic method.
#[derive(Debug, Clone)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
}

/// A named bearer token for the token method.
#[derive(Debug, Clone)]
pub struct TokenCredential {
    /// Identity assigned to peers presenting this token.
    pub name: String,
    pub token: String,
}

/// Authentication settings and the credential tables.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    /// Failures inside the window before an ip is rate limited.
    pub max_failed_attempts: u32,
    pub rate_limit_duration_minutes: u64,
    pub users: Vec<UserCredential>,
    pub tokens: Vec<TokenCredential>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            enabled: true,
            max_failed_attempts: 5,
            rate_limit_duration_minutes: 15,
            users: Vec::new(),
            tokens: Vec::new(),
        }
    }
}

/// Per-session outbound queue bounds.
///
/// Between soft and hard, Low-priority enqueues are rejected; at or above
/// hard, everything is rejected with `BACKPRESSURE`.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub soft_limit: usize,
    pub hard_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            soft_limit: 10_000,
            hard_limit: 50_000,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.soft_limit == 0 || self.hard_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "queue limits must be non-zero".to_owned(),
            ));
        }
        if self.soft_limit > self.hard_limit {
            return Err(ConfigError::InvalidValue(format!(
                "soft limit {} exceeds hard limit {}",
                self.soft_limit, self.hard_limit
            )));
        }
        Ok(())
    }
}

/// QoS retry parameters: the delay before retry `attempt` (1-based) is
/// `base * 2^(attempt-1)` capped at `max`, with ±`jitter` applied.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    /// Fractional jitter, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 3,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base.is_zero() {
            return Err(ConfigError::InvalidValue(
                "retry base must be non-zero".to_owned(),
            ));
        }
        if self.max < self.base {
            return Err(ConfigError::InvalidValue(
                "retry max must be >= retry base".to_owned(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidValue(format!(
                "jitter {} must be in [0, 1)",
                self.jitter
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        BrokerConfig::default().validate().expect("defaults");
    }

    #[test]
    fn inverted_queue_bounds_are_rejected() {
        let mut cfg = BrokerConfig::default();
        cfg.queue.soft_limit = 100;
        cfg.queue.hard_limit = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn filtering_without_an_allow_list_is_rejected() {
        let mut cfg = BrokerConfig::default();
        cfg.enable_command_filtering = true;
        assert!(cfg.validate().is_err());
    }
}
