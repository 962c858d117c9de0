//! Stable error-code identifiers carried in Error envelopes.
//!
//! These spellings are part of the wire contract; clients switch on them.

/// Command targeted a device the registry does not show as connected.
pub const DEVICE_UNAVAILABLE: &str = "DEVICE_UNAVAILABLE";
/// No Response arrived before the pending-response deadline.
pub const TIMEOUT: &str = "TIMEOUT";
/// The session stopped while the message was still queued.
pub const CANCELLED: &str = "CANCELLED";
/// The target session's outbound queue refused the message.
pub const BACKPRESSURE: &str = "BACKPRESSURE";
/// The peer has not completed the authentication handshake.
pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
/// Too many failed authentication attempts inside the window.
pub const RATE_LIMITED: &str = "RATE_LIMITED";
/// The inbound bytes did not decode into a valid envelope.
pub const INVALID_ENVELOPE: &str = "INVALID_ENVELOPE";
/// The command is not in the server's allowed set.
pub const UNSUPPORTED_COMMAND: &str = "UNSUPPORTED_COMMAND";
/// A device with this id already holds a live session.
pub const DUPLICATE_REGISTRATION: &str = "DUPLICATE_REGISTRATION";
