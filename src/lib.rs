//! skybus: a device control and telemetry broker for remotely operated
//! astronomy instruments.
//!
//! This crate re-exports the workspace members; the end-to-end broker
//! scenarios live in `tests/integration/`.
//!
//! - [`protocol`] — envelope model and canonical JSON codec
//! - [`core`] — sessions, registry, QoS queueing, routing, fan-out,
//!   authentication, error recovery
//! - [`transport`] — stdio/TCP/WebSocket/MQTT adaptors and the
//!   cross-protocol bridge

pub use skybus_core as core;
pub use skybus_protocol as protocol;
pub use skybus_transport as transport;
