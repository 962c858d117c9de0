//! Envelope model: the eight message kinds and their shared header.
//!
//! Construction helpers mint v4 UUIDs and stamp the current UTC time,
//! truncated to millisecond precision so a round trip through the codec
//! compares equal.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Header enums
// ---------------------------------------------------------------------------

/// The eight wire message kinds, spelled exactly as they appear in the
/// `messageType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Command,
    Response,
    Event,
    Error,
    DiscoveryRequest,
    DiscoveryResponse,
    Registration,
    Authentication,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Command => "Command",
            MessageType::Response => "Response",
            MessageType::Event => "Event",
            MessageType::Error => "Error",
            MessageType::DiscoveryRequest => "DiscoveryRequest",
            MessageType::DiscoveryResponse => "DiscoveryResponse",
            MessageType::Registration => "Registration",
            MessageType::Authentication => "Authentication",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Command" => MessageType::Command,
            "Response" => MessageType::Response,
            "Event" => MessageType::Event,
            "Error" => MessageType::Error,
            "DiscoveryRequest" => MessageType::DiscoveryRequest,
            "DiscoveryResponse" => MessageType::DiscoveryResponse,
            "Registration" => MessageType::Registration,
            "Authentication" => MessageType::Authentication,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue ordering only; delivery semantics are controlled by [`QoS`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize_repr,
    Deserialize_repr,
)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            3 => Priority::Critical,
            _ => return None,
        })
    }

    /// Accepts the string spellings the original broker emitted.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "low" => Priority::Low,
            "normal" => Priority::Normal,
            "high" => Priority::High,
            "critical" => Priority::Critical,
            _ => return None,
        })
    }
}

/// Per-message delivery contract.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => return None,
        })
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "at_most_once" => QoS::AtMostOnce,
            "at_least_once" => QoS::AtLeastOnce,
            "exactly_once" => QoS::ExactlyOnce,
            _ => return None,
        })
    }

    /// True when the sender must hold the message until a matching
    /// Response/Error acknowledges it.
    pub fn needs_ack(self) -> bool {
        !matches!(self, QoS::AtMostOnce)
    }
}

/// Severity carried by Error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "Debug",
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Critical => "Critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Debug" => Severity::Debug,
            "Info" => Severity::Info,
            "Warning" => Severity::Warning,
            "Error" => Severity::Error,
            "Critical" => Severity::Critical,
            _ => return None,
        })
    }
}

/// Credential scheme carried by Authentication envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// `credentials` is base64 `user:pass`.
    Basic,
    /// `credentials` is an opaque bearer token.
    Token,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::Basic => "basic",
            AuthMethod::Token => "token",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "basic" => AuthMethod::Basic,
            "token" => AuthMethod::Token,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Device info
// ---------------------------------------------------------------------------

/// Device identity and capability snapshot carried by Registration and
/// Discovery messages, and cached in the registry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, device_type: impl Into<String>) -> Self {
        DeviceInfo {
            id: id.into(),
            device_type: device_type.into(),
            ..DeviceInfo::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Command addressed to a device (or to the broker itself when the
/// target device id is empty).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandPayload {
    pub command: String,
    pub parameters: Map<String, Value>,
    pub properties: Option<Map<String, Value>>,
}

/// Response to a Command; `original_message_id` on the envelope carries
/// the correlation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponsePayload {
    /// "OK", "ERROR", or a domain-specific status.
    pub status: String,
    /// Echo of the triggering command name.
    pub command: Option<String>,
    pub properties: Option<Map<String, Value>>,
    pub details: Option<Value>,
}

/// Named event originating at a device (or synthesized by the broker).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventPayload {
    pub event: String,
    pub properties: Option<Map<String, Value>>,
    pub details: Option<Value>,
    pub related_message_id: Option<String>,
}

/// Error report; correlated to a Command via `original_message_id` when
/// one triggered it.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    /// Stable identifier, e.g. `DEVICE_UNAVAILABLE`.
    pub error_code: String,
    pub error_message: String,
    pub details: Option<Value>,
    pub severity: Severity,
}

/// Device announcing itself; the envelope `deviceId` is the sender.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationPayload {
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiscoveryRequestPayload {
    /// Empty means all device types.
    pub device_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiscoveryResponsePayload {
    /// Device id → info snapshot.  Ordered so encoding is deterministic.
    pub devices: BTreeMap<String, DeviceInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationPayload {
    pub method: AuthMethod,
    pub credentials: String,
}

/// Typed payload, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Command(CommandPayload),
    Response(ResponsePayload),
    Event(EventPayload),
    Error(ErrorPayload),
    DiscoveryRequest(DiscoveryRequestPayload),
    DiscoveryResponse(DiscoveryResponsePayload),
    Registration(RegistrationPayload),
    Authentication(AuthenticationPayload),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Command(_) => MessageType::Command,
            Payload::Response(_) => MessageType::Response,
            Payload::Event(_) => MessageType::Event,
            Payload::Error(_) => MessageType::Error,
            Payload::DiscoveryRequest(_) => MessageType::DiscoveryRequest,
            Payload::DiscoveryResponse(_) => MessageType::DiscoveryResponse,
            Payload::Registration(_) => MessageType::Registration,
            Payload::Authentication(_) => MessageType::Authentication,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A single wire message: shared header plus one typed payload.
///
/// `device_id` is the target for Command/Error/Event and the sender for
/// Registration; `original_message_id` is present on Response/Error and
/// correlates to the triggering Command.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message_id: String,
    pub device_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub original_message_id: Option<String>,
    pub priority: Priority,
    pub qos: QoS,
    /// 0 = never expires; otherwise discard if not delivered/acked by
    /// `timestamp + expire_after_seconds`.
    pub expire_after_seconds: u32,
    pub payload: Payload,
    /// Keys the decoder did not recognize, preserved for round-tripping.
    pub extensions: Map<String, Value>,
}

/// Mint a fresh globally unique message id.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current UTC time truncated to millisecond precision (the wire format's
/// resolution, so constructed envelopes survive a codec round trip).
pub(crate) fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

pub(crate) fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = t.nanosecond() / 1_000_000 * 1_000_000;
    t.with_nanosecond(nanos).unwrap_or(t)
}

impl Envelope {
    /// New envelope with a fresh id, the current timestamp, and default
    /// header values (Normal priority, AtMostOnce, no expiry).
    pub fn new(payload: Payload) -> Self {
        Envelope {
            message_id: new_message_id(),
            device_id: None,
            timestamp: now_millis(),
            original_message_id: None,
            priority: Priority::Normal,
            qos: QoS::AtMostOnce,
            expire_after_seconds: 0,
            payload,
            extensions: Map::new(),
        }
    }

    pub fn command(
        device_id: impl Into<String>,
        command: impl Into<String>,
        parameters: Map<String, Value>,
    ) -> Self {
        let mut env = Envelope::new(Payload::Command(CommandPayload {
            command: command.into(),
            parameters,
            properties: None,
        }));
        env.device_id = Some(device_id.into());
        env
    }

    /// Response correlated to `original`, echoing its command name and
    /// device id.
    pub fn response_to(original: &Envelope, status: impl Into<String>) -> Self {
        let command = match &original.payload {
            Payload::Command(c) => Some(c.command.clone()),
            _ => None,
        };
        let mut env = Envelope::new(Payload::Response(ResponsePayload {
            status: status.into(),
            command,
            properties: None,
            details: None,
        }));
        env.device_id = original.device_id.clone();
        env.original_message_id = Some(original.message_id.clone());
        env
    }

    pub fn event(device_id: impl Into<String>, event: impl Into<String>) -> Self {
        let mut env = Envelope::new(Payload::Event(EventPayload {
            event: event.into(),
            properties: None,
            details: None,
            related_message_id: None,
        }));
        env.device_id = Some(device_id.into());
        env
    }

    /// Error envelope correlated to the message id of `original`.
    pub fn error_to(
        original: &Envelope,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        let mut env = Envelope::error(error_code, error_message);
        env.device_id = original.device_id.clone();
        env.original_message_id = Some(original.message_id.clone());
        env
    }

    /// Uncorrelated Error envelope.
    pub fn error(error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        Envelope::new(Payload::Error(ErrorPayload {
            error_code: error_code.into(),
            error_message: error_message.into(),
            details: None,
            severity: Severity::Error,
        }))
    }

    pub fn registration(device_info: DeviceInfo) -> Self {
        let mut env = Envelope::new(Payload::Registration(RegistrationPayload {
            device_info: device_info.clone(),
        }));
        env.device_id = Some(device_info.id);
        env
    }

    pub fn discovery_request(device_types: Vec<String>) -> Self {
        Envelope::new(Payload::DiscoveryRequest(DiscoveryRequestPayload {
            device_types,
        }))
    }

    pub fn discovery_response(
        request: &Envelope,
        devices: BTreeMap<String, DeviceInfo>,
    ) -> Self {
        let mut env = Envelope::new(Payload::DiscoveryResponse(DiscoveryResponsePayload {
            devices,
        }));
        env.original_message_id = Some(request.message_id.clone());
        env
    }

    pub fn authentication(method: AuthMethod, credentials: impl Into<String>) -> Self {
        Envelope::new(Payload::Authentication(AuthenticationPayload {
            method,
            credentials: credentials.into(),
        }))
    }

    // -----------------------------------------------------------------------
    // Builder-style header setters
    // -----------------------------------------------------------------------

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_expiry(mut self, expire_after_seconds: u32) -> Self {
        self.expire_after_seconds = expire_after_seconds;
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Deadline after which the envelope must not be written, or None for
    /// no expiry.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expire_after_seconds == 0 {
            None
        } else {
            Some(self.timestamp + chrono::Duration::seconds(i64::from(self.expire_after_seconds)))
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(deadline) => now > deadline,
            None => false,
        }
    }
}
