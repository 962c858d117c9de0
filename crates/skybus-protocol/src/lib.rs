// skybus-protocol: Broker wire protocol types and serialization.
//
// Every message on every transport is a single self-describing JSON
// envelope with a top-level `messageType` discriminator.  The envelope
// header (id, target, timestamp, priority, qos, expiry) is shared by all
// eight message kinds; the payload fields vary per kind.
//
// Encoding is canonical: fixed key spellings, integer priority/qos,
// ISO-8601 UTC timestamps with millisecond precision.  Keys the decoder
// does not recognize are preserved in a sidecar `extensions` map so
// bridges can round-trip opaque protocol extensions.

mod codec;
mod envelope;
pub mod error_codes;

pub use codec::{decode, encode, DecodeError};
pub use envelope::{
    new_message_id, AuthMethod, AuthenticationPayload, CommandPayload, DeviceInfo,
    DiscoveryRequestPayload, DiscoveryResponsePayload, Envelope, ErrorPayload, EventPayload,
    MessageType, Payload, Priority, QoS, RegistrationPayload, ResponsePayload, Severity,
};

/// Event name used for property-change notifications synthesized by the
/// router when a Response's `properties` differ from the cached state.
pub const PROPERTY_CHANGED_EVENT: &str = "property_changed";

/// Event name emitted by the Notify recovery strategy.
pub const ERROR_NOTICE_EVENT: &str = "error_notice";

/// Event name emitted when the Failover recovery strategy trips.
pub const DEVICE_FAILOVER_EVENT: &str = "device_failover";
