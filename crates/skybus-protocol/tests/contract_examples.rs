/// Contract golden tests: decode literal wire documents for every message
/// kind, check the decoded fields, and verify the encode/decode round trip
/// reproduces the original document.
use serde_json::{json, Value};
use skybus_protocol::{
    decode, encode, AuthMethod, Envelope, MessageType, Payload, Priority, QoS, Severity,
};

/// Helper: decode a literal document, re-encode, and assert the JSON is
/// reproduced exactly (field for field, including unknown keys).
fn round_trip(doc: Value) -> Envelope {
    let env = decode(doc.to_string().as_bytes())
        .unwrap_or_else(|e| panic!("failed to decode {}: {}", doc, e));
    let reencoded: Value = serde_json::from_slice(&encode(&env)).unwrap();
    assert_eq!(doc, reencoded, "round-trip mismatch");
    env
}

#[test]
fn command_wire_example() {
    let env = round_trip(json!({
        "messageType": "Command",
        "messageId": "7f3a2c10-1111-4222-8333-444455556666",
        "deviceId": "telescope-1",
        "timestamp": "2025-01-01T12:00:00.000Z",
        "priority": 2,
        "qos": 1,
        "expireAfterSeconds": 30,
        "command": "goto",
        "parameters": {"dec": 45.0, "ra": 12.5}
    }));
    assert_eq!(env.message_type(), MessageType::Command);
    assert_eq!(env.device_id.as_deref(), Some("telescope-1"));
    assert_eq!(env.priority, Priority::High);
    assert_eq!(env.qos, QoS::AtLeastOnce);
    assert_eq!(env.expire_after_seconds, 30);
    let Payload::Command(cmd) = &env.payload else {
        panic!("expected Command payload");
    };
    assert_eq!(cmd.command, "goto");
    assert_eq!(cmd.parameters["ra"], json!(12.5));
}

#[test]
fn response_wire_example() {
    let env = round_trip(json!({
        "messageType": "Response",
        "messageId": "r-1",
        "deviceId": "telescope-1",
        "timestamp": "2025-01-01T12:00:00.250Z",
        "originalMessageId": "m-1",
        "priority": 1,
        "qos": 0,
        "expireAfterSeconds": 0,
        "status": "OK",
        "command": "goto",
        "properties": {"slewing": true}
    }));
    assert_eq!(env.original_message_id.as_deref(), Some("m-1"));
    let Payload::Response(resp) = &env.payload else {
        panic!("expected Response payload");
    };
    assert_eq!(resp.status, "OK");
    assert_eq!(resp.command.as_deref(), Some("goto"));
}

#[test]
fn event_wire_example() {
    let env = round_trip(json!({
        "messageType": "Event",
        "messageId": "e-1",
        "deviceId": "camera-1",
        "timestamp": "2025-01-01T12:00:01.000Z",
        "priority": 1,
        "qos": 0,
        "expireAfterSeconds": 0,
        "event": "exposure_complete",
        "details": {"durationSeconds": 120},
        "relatedMessageId": "m-9"
    }));
    let Payload::Event(ev) = &env.payload else {
        panic!("expected Event payload");
    };
    assert_eq!(ev.event, "exposure_complete");
    assert_eq!(ev.related_message_id.as_deref(), Some("m-9"));
}

#[test]
fn error_wire_example() {
    let env = round_trip(json!({
        "messageType": "Error",
        "messageId": "err-1",
        "deviceId": "focuser-1",
        "timestamp": "2025-01-01T12:00:02.000Z",
        "originalMessageId": "m-2",
        "priority": 2,
        "qos": 0,
        "expireAfterSeconds": 0,
        "errorCode": "MOTOR_STALL",
        "errorMessage": "focuser motor stalled at position 1200",
        "severity": "Critical"
    }));
    let Payload::Error(err) = &env.payload else {
        panic!("expected Error payload");
    };
    assert_eq!(err.error_code, "MOTOR_STALL");
    assert_eq!(err.severity, Severity::Critical);
}

#[test]
fn registration_wire_example() {
    let env = round_trip(json!({
        "messageType": "Registration",
        "messageId": "reg-1",
        "deviceId": "scope-1",
        "timestamp": "2025-01-01T12:00:00.000Z",
        "priority": 1,
        "qos": 0,
        "expireAfterSeconds": 0,
        "deviceInfo": {
            "id": "scope-1",
            "type": "telescope",
            "manufacturer": "Meade",
            "model": "LX200",
            "firmwareVersion": "4.2g",
            "capabilities": ["goto", "park"],
            "properties": {"parked": true}
        }
    }));
    let Payload::Registration(reg) = &env.payload else {
        panic!("expected Registration payload");
    };
    assert_eq!(reg.device_info.device_type, "telescope");
    assert_eq!(reg.device_info.capabilities, vec!["goto", "park"]);
}

#[test]
fn discovery_round_trip() {
    let env = round_trip(json!({
        "messageType": "DiscoveryRequest",
        "messageId": "d-1",
        "timestamp": "2025-01-01T12:00:00.000Z",
        "priority": 1,
        "qos": 0,
        "expireAfterSeconds": 0,
        "deviceTypes": ["telescope", "camera"]
    }));
    let Payload::DiscoveryRequest(req) = &env.payload else {
        panic!("expected DiscoveryRequest payload");
    };
    assert_eq!(req.device_types.len(), 2);

    round_trip(json!({
        "messageType": "DiscoveryResponse",
        "messageId": "d-2",
        "timestamp": "2025-01-01T12:00:00.100Z",
        "originalMessageId": "d-1",
        "priority": 1,
        "qos": 0,
        "expireAfterSeconds": 0,
        "devices": {
            "scope-1": {"id": "scope-1", "type": "telescope"}
        }
    }));
}

#[test]
fn authentication_wire_example() {
    let env = round_trip(json!({
        "messageType": "Authentication",
        "messageId": "a-1",
        "timestamp": "2025-01-01T12:00:00.000Z",
        "priority": 1,
        "qos": 0,
        "expireAfterSeconds": 0,
        "method": "token",
        "credentials": "s3cr3t-bearer"
    }));
    let Payload::Authentication(auth) = &env.payload else {
        panic!("expected Authentication payload");
    };
    assert_eq!(auth.method, AuthMethod::Token);
    assert_eq!(auth.credentials, "s3cr3t-bearer");
}

#[test]
fn builder_envelopes_survive_the_codec() {
    let original = Envelope::command("scope-1", "park", serde_json::Map::new())
        .with_qos(QoS::ExactlyOnce)
        .with_expiry(60);
    let response = Envelope::response_to(&original, "OK");
    for env in [original, response] {
        let decoded = decode(&encode(&env)).expect("decode");
        assert_eq!(decoded, env);
    }
}
