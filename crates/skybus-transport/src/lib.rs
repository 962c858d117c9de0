//! Transport adaptors: framed links over stdio, TCP, WebSocket, and
//! MQTT, all presenting the broker's uniform peer interface.
//!
//! Server-role adaptors accept connections and hand each accepted peer
//! to the broker (`Broker::attach_link`) with a transport tag; client
//! role adaptors surface one connected link for the caller to drive.
//!
//! ZeroMQ and gRPC remain extension points: the original system shipped
//! them as stubs, and their native ack semantics must be mapped onto the
//! core QoS contract when a real library is wired in.  Everything here
//! goes through the same [`skybus_core::link`] traits, so adding one is
//! an adaptor-local change.

pub mod bridge;
pub mod framing;
pub mod mqtt;
pub mod stdio;
pub mod tcp;
pub mod ws;

use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid transport config: {0}")]
    Config(String),
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport is not running")]
    NotRunning,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// How frames are delimited on byte-stream transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// Terminator-delimited UTF-8 JSON (default `\n`; any byte works as
    /// a custom delimiter).
    Delimited { terminator: u8 },
    /// 4-byte big-endian length prefix, for opaque payloads.
    LengthPrefixed,
}

impl Default for FramingMode {
    fn default() -> Self {
        FramingMode::Delimited { terminator: b'\n' }
    }
}

/// Payload compression.  An extension point: nothing beyond `None` is
/// shipped, but the option travels through configs so adaptors can
/// negotiate it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
}

/// Per-adaptor options.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Read chunk size for byte-stream transports.
    pub buffer_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Frames larger than this are rejected before decoding.
    pub max_message_size: usize,
    pub framing: FramingMode,
    pub compression: CompressionType,
    /// TLS termination is provisioned outside the core; the flag only
    /// selects `wss://`-style endpoints where an adaptor supports it.
    pub tls_enabled: bool,
    /// Socket-level tuning (e.g. TCP_NODELAY).
    pub platform_optimizations: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            buffer_size: 8 * 1024,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024,
            framing: FramingMode::default(),
            compression: CompressionType::None,
            tls_enabled: false,
            platform_optimizations: true,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.buffer_size == 0 {
            return Err(TransportError::Config("buffer_size must be non-zero".into()));
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(TransportError::Config("timeouts must be non-zero".into()));
        }
        if self.max_message_size == 0 {
            return Err(TransportError::Config(
                "max_message_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_endpoint(endpoint: &str) -> Result<(), TransportError> {
    if endpoint.trim().is_empty() {
        return Err(TransportError::Config("endpoint must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        TransportConfig::default().validate().expect("defaults");
    }

    #[test]
    fn zero_options_are_rejected() {
        let mut cfg = TransportConfig::default();
        cfg.buffer_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = TransportConfig::default();
        cfg.read_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = TransportConfig::default();
        cfg.max_message_size = 0;
        assert!(cfg.validate().is_err());

        assert!(validate_endpoint("  ").is_err());
        assert!(validate_endpoint("127.0.0.1:7800").is_ok());
    }
}
