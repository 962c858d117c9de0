//! Canonical JSON codec for [`Envelope`].
//!
//! Encoding writes the fixed key spellings from the wire contract;
//! decoding extracts the known keys, validates the required ones, and
//! stashes everything it does not recognize in the envelope's
//! `extensions` map so a re-encode reproduces the original document.
//!
//! Validation rules:
//! - every envelope needs `messageType`, `messageId`, `timestamp`;
//! - Commands need a non-empty `command`;
//! - Registrations need `deviceInfo.id` and `deviceInfo.type`.

use crate::envelope::{
    truncate_millis, AuthMethod, AuthenticationPayload, CommandPayload, DeviceInfo,
    DiscoveryRequestPayload, DiscoveryResponsePayload, Envelope, ErrorPayload, EventPayload,
    MessageType, Payload, Priority, QoS, RegistrationPayload, ResponsePayload, Severity,
};
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

// ---------------------------------------------------------------------------
// Public error type
// ---------------------------------------------------------------------------

/// Why a byte sequence failed to decode into an envelope.
///
/// The reason is human-readable; the caller decides whether to answer
/// with an `INVALID_ENVELOPE` Error envelope.
#[derive(Debug)]
pub enum DecodeError {
    /// The bytes were not valid JSON at all.
    Json(String),
    /// The document was valid JSON but not an object.
    NotAnObject,
    /// A required field is absent.
    MissingField(&'static str),
    /// A field is present but malformed.
    InvalidField { field: &'static str, reason: String },
    /// `messageType` named none of the eight kinds.
    UnknownMessageType(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "invalid JSON: {}", e),
            DecodeError::NotAnObject => write!(f, "envelope must be a JSON object"),
            DecodeError::MissingField(field) => write!(f, "missing required field '{}'", field),
            DecodeError::InvalidField { field, reason } => {
                write!(f, "invalid field '{}': {}", field, reason)
            }
            DecodeError::UnknownMessageType(t) => write!(f, "unknown messageType '{}'", t),
        }
    }
}

impl std::error::Error for DecodeError {}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Encode an envelope as a canonical JSON byte vector (no trailing
/// newline; framing is the transport's concern).
pub fn encode(env: &Envelope) -> Vec<u8> {
    // A Value built from known-serializable parts cannot fail to render.
    serde_json::to_vec(&to_value(env)).unwrap_or_default()
}

/// Decode one framed message into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Json(e.to_string()))?;
    from_value(value)
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        to_value(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        from_value(value).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn to_value(env: &Envelope) -> Value {
    let mut doc = Map::new();
    doc.insert(
        "messageType".to_owned(),
        Value::String(env.message_type().as_str().to_owned()),
    );
    doc.insert("messageId".to_owned(), Value::String(env.message_id.clone()));
    if let Some(device_id) = &env.device_id {
        doc.insert("deviceId".to_owned(), Value::String(device_id.clone()));
    }
    doc.insert(
        "timestamp".to_owned(),
        Value::String(env.timestamp.format(TIMESTAMP_FORMAT).to_string()),
    );
    if let Some(original) = &env.original_message_id {
        doc.insert("originalMessageId".to_owned(), Value::String(original.clone()));
    }
    doc.insert("priority".to_owned(), Value::from(env.priority as u8));
    doc.insert("qos".to_owned(), Value::from(env.qos as u8));
    doc.insert(
        "expireAfterSeconds".to_owned(),
        Value::from(env.expire_after_seconds),
    );

    match &env.payload {
        Payload::Command(p) => {
            doc.insert("command".to_owned(), Value::String(p.command.clone()));
            doc.insert("parameters".to_owned(), Value::Object(p.parameters.clone()));
            if let Some(props) = &p.properties {
                doc.insert("properties".to_owned(), Value::Object(props.clone()));
            }
        }
        Payload::Response(p) => {
            doc.insert("status".to_owned(), Value::String(p.status.clone()));
            if let Some(command) = &p.command {
                doc.insert("command".to_owned(), Value::String(command.clone()));
            }
            if let Some(props) = &p.properties {
                doc.insert("properties".to_owned(), Value::Object(props.clone()));
            }
            if let Some(details) = &p.details {
                doc.insert("details".to_owned(), details.clone());
            }
        }
        Payload::Event(p) => {
            doc.insert("event".to_owned(), Value::String(p.event.clone()));
            if let Some(props) = &p.properties {
                doc.insert("properties".to_owned(), Value::Object(props.clone()));
            }
            if let Some(details) = &p.details {
                doc.insert("details".to_owned(), details.clone());
            }
            if let Some(related) = &p.related_message_id {
                doc.insert("relatedMessageId".to_owned(), Value::String(related.clone()));
            }
        }
        Payload::Error(p) => {
            doc.insert("errorCode".to_owned(), Value::String(p.error_code.clone()));
            doc.insert(
                "errorMessage".to_owned(),
                Value::String(p.error_message.clone()),
            );
            if let Some(details) = &p.details {
                doc.insert("details".to_owned(), details.clone());
            }
            doc.insert(
                "severity".to_owned(),
                Value::String(p.severity.as_str().to_owned()),
            );
        }
        Payload::DiscoveryRequest(p) => {
            doc.insert(
                "deviceTypes".to_owned(),
                Value::Array(p.device_types.iter().cloned().map(Value::String).collect()),
            );
        }
        Payload::DiscoveryResponse(p) => {
            let mut devices = Map::new();
            for (id, info) in &p.devices {
                // DeviceInfo serialization is derive-driven and total.
                devices.insert(
                    id.clone(),
                    serde_json::to_value(info).unwrap_or(Value::Null),
                );
            }
            doc.insert("devices".to_owned(), Value::Object(devices));
        }
        Payload::Registration(p) => {
            doc.insert(
                "deviceInfo".to_owned(),
                serde_json::to_value(&p.device_info).unwrap_or(Value::Null),
            );
        }
        Payload::Authentication(p) => {
            doc.insert(
                "method".to_owned(),
                Value::String(p.method.as_str().to_owned()),
            );
            doc.insert(
                "credentials".to_owned(),
                Value::String(p.credentials.clone()),
            );
        }
    }

    // Extensions last; canonical keys always win on collision.
    for (key, value) in &env.extensions {
        doc.entry(key.clone()).or_insert_with(|| value.clone());
    }

    Value::Object(doc)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn from_value(value: Value) -> Result<Envelope, DecodeError> {
    let Value::Object(mut doc) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let type_str = take_string(&mut doc, "messageType")?
        .ok_or(DecodeError::MissingField("messageType"))?;
    let message_type =
        MessageType::parse(&type_str).ok_or(DecodeError::UnknownMessageType(type_str))?;

    let message_id =
        take_string(&mut doc, "messageId")?.ok_or(DecodeError::MissingField("messageId"))?;
    if message_id.is_empty() {
        return Err(DecodeError::InvalidField {
            field: "messageId",
            reason: "must not be empty".to_owned(),
        });
    }

    let timestamp = parse_timestamp(
        &take_string(&mut doc, "timestamp")?.ok_or(DecodeError::MissingField("timestamp"))?,
    )?;

    let device_id = take_string(&mut doc, "deviceId")?;
    let original_message_id = take_string(&mut doc, "originalMessageId")?;
    let priority = take_priority(&mut doc)?;
    let qos = take_qos(&mut doc)?;
    let expire_after_seconds = take_u32(&mut doc, "expireAfterSeconds")?.unwrap_or(0);

    let payload = match message_type {
        MessageType::Command => {
            let command =
                take_string(&mut doc, "command")?.ok_or(DecodeError::MissingField("command"))?;
            if command.is_empty() {
                return Err(DecodeError::InvalidField {
                    field: "command",
                    reason: "must not be empty".to_owned(),
                });
            }
            Payload::Command(CommandPayload {
                command,
                parameters: take_object(&mut doc, "parameters")?.unwrap_or_default(),
                properties: take_object(&mut doc, "properties")?,
            })
        }
        MessageType::Response => Payload::Response(ResponsePayload {
            status: take_string(&mut doc, "status")?.ok_or(DecodeError::MissingField("status"))?,
            command: take_string(&mut doc, "command")?,
            properties: take_object(&mut doc, "properties")?,
            details: doc.remove("details"),
        }),
        MessageType::Event => {
            let event =
                take_string(&mut doc, "event")?.ok_or(DecodeError::MissingField("event"))?;
            Payload::Event(EventPayload {
                event,
                properties: take_object(&mut doc, "properties")?,
                details: doc.remove("details"),
                related_message_id: take_string(&mut doc, "relatedMessageId")?,
            })
        }
        MessageType::Error => {
            let error_code = take_string(&mut doc, "errorCode")?
                .ok_or(DecodeError::MissingField("errorCode"))?;
            let severity = match take_string(&mut doc, "severity")? {
                Some(s) => Severity::parse(&s).ok_or(DecodeError::InvalidField {
                    field: "severity",
                    reason: format!("unknown severity '{}'", s),
                })?,
                None => Severity::Error,
            };
            Payload::Error(ErrorPayload {
                error_code,
                error_message: take_string(&mut doc, "errorMessage")?.unwrap_or_default(),
                details: doc.remove("details"),
                severity,
            })
        }
        MessageType::DiscoveryRequest => Payload::DiscoveryRequest(DiscoveryRequestPayload {
            device_types: take_string_array(&mut doc, "deviceTypes")?.unwrap_or_default(),
        }),
        MessageType::DiscoveryResponse => {
            let mut devices = BTreeMap::new();
            if let Some(map) = take_object(&mut doc, "devices")? {
                for (id, info) in map {
                    let info: DeviceInfo =
                        serde_json::from_value(info).map_err(|e| DecodeError::InvalidField {
                            field: "devices",
                            reason: format!("device '{}': {}", id, e),
                        })?;
                    devices.insert(id, info);
                }
            }
            Payload::DiscoveryResponse(DiscoveryResponsePayload { devices })
        }
        MessageType::Registration => {
            let raw = doc
                .remove("deviceInfo")
                .ok_or(DecodeError::MissingField("deviceInfo"))?;
            let device_info: DeviceInfo =
                serde_json::from_value(raw).map_err(|e| DecodeError::InvalidField {
                    field: "deviceInfo",
                    reason: e.to_string(),
                })?;
            if device_info.id.is_empty() {
                return Err(DecodeError::InvalidField {
                    field: "deviceInfo",
                    reason: "deviceInfo.id must not be empty".to_owned(),
                });
            }
            if device_info.device_type.is_empty() {
                return Err(DecodeError::InvalidField {
                    field: "deviceInfo",
                    reason: "deviceInfo.type must not be empty".to_owned(),
                });
            }
            Payload::Registration(RegistrationPayload { device_info })
        }
        MessageType::Authentication => {
            let method_str =
                take_string(&mut doc, "method")?.ok_or(DecodeError::MissingField("method"))?;
            let method = AuthMethod::parse(&method_str).ok_or(DecodeError::InvalidField {
                field: "method",
                reason: format!("unknown method '{}'", method_str),
            })?;
            Payload::Authentication(AuthenticationPayload {
                method,
                credentials: take_string(&mut doc, "credentials")?
                    .ok_or(DecodeError::MissingField("credentials"))?,
            })
        }
    };

    Ok(Envelope {
        message_id,
        device_id,
        timestamp,
        original_message_id,
        priority,
        qos,
        expire_after_seconds,
        payload,
        extensions: doc,
    })
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn take_string(
    doc: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, DecodeError> {
    match doc.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected string, got {}", json_kind(&other)),
        }),
    }
}

fn take_object(
    doc: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Option<Map<String, Value>>, DecodeError> {
    match doc.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected object, got {}", json_kind(&other)),
        }),
    }
}

fn take_string_array(
    doc: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Option<Vec<String>>, DecodeError> {
    match doc.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s),
                    other => {
                        return Err(DecodeError::InvalidField {
                            field,
                            reason: format!("expected string element, got {}", json_kind(&other)),
                        });
                    }
                }
            }
            Ok(Some(out))
        }
        Some(other) => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected array, got {}", json_kind(&other)),
        }),
    }
}

fn take_u32(
    doc: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Option<u32>, DecodeError> {
    match doc.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let v = n.as_u64().ok_or_else(|| DecodeError::InvalidField {
                field,
                reason: format!("expected non-negative integer, got {}", n),
            })?;
            u32::try_from(v).map(Some).map_err(|_| DecodeError::InvalidField {
                field,
                reason: format!("value {} out of range", v),
            })
        }
        Some(other) => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected integer, got {}", json_kind(&other)),
        }),
    }
}

fn take_priority(doc: &mut Map<String, Value>) -> Result<Priority, DecodeError> {
    match doc.remove("priority") {
        None | Some(Value::Null) => Ok(Priority::Normal),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .and_then(Priority::from_u8)
            .ok_or_else(|| DecodeError::InvalidField {
                field: "priority",
                reason: format!("expected 0..=3, got {}", n),
            }),
        // The original broker emitted string spellings; accept them so
        // bridged traffic decodes.
        Some(Value::String(s)) => Priority::parse(&s).ok_or(DecodeError::InvalidField {
            field: "priority",
            reason: format!("unknown priority '{}'", s),
        }),
        Some(other) => Err(DecodeError::InvalidField {
            field: "priority",
            reason: format!("expected integer or string, got {}", json_kind(&other)),
        }),
    }
}

fn take_qos(doc: &mut Map<String, Value>) -> Result<QoS, DecodeError> {
    match doc.remove("qos") {
        None | Some(Value::Null) => Ok(QoS::AtMostOnce),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .and_then(QoS::from_u8)
            .ok_or_else(|| DecodeError::InvalidField {
                field: "qos",
                reason: format!("expected 0..=2, got {}", n),
            }),
        Some(Value::String(s)) => QoS::parse(&s).ok_or(DecodeError::InvalidField {
            field: "qos",
            reason: format!("unknown qos '{}'", s),
        }),
        Some(other) => Err(DecodeError::InvalidField {
            field: "qos",
            reason: format!("expected integer or string, got {}", json_kind(&other)),
        }),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| truncate_millis(t.with_timezone(&Utc)))
        .map_err(|e| DecodeError::InvalidField {
            field: "timestamp",
            reason: e.to_string(),
        })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
