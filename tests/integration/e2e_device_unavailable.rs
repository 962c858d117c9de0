/// Commands for unknown or disconnected devices are answered with
/// `DEVICE_UNAVAILABLE` in one routing step, with no device traffic.
use skybus::core::{Broker, BrokerConfig};
use skybus::protocol::{error_codes, Envelope, MessageType, Payload};
use skybus_test_utils::{attach_client, attach_device};
use std::time::Duration;

fn quiet_config() -> BrokerConfig {
    let mut cfg = BrokerConfig::open();
    cfg.heartbeat_interval_secs = 0;
    cfg
}

#[tokio::test]
async fn unknown_device_is_answered_immediately() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let (_client_id, mut client) = attach_client(&broker).await;
    let command = Envelope::command("ghost", "goto", serde_json::Map::new());
    client.send(&command);

    let error = client.recv_until(MessageType::Error).await;
    assert_eq!(
        error.original_message_id.as_deref(),
        Some(command.message_id.as_str())
    );
    let Payload::Error(err) = &error.payload else {
        panic!("expected Error payload");
    };
    assert_eq!(err.error_code, error_codes::DEVICE_UNAVAILABLE);

    // Nothing was routed and nothing is pending.
    assert_eq!(broker.counters().commands_routed(), 0);
    assert_eq!(broker.router().pending_len().await, 0);

    broker.stop().await;
}

#[tokio::test]
async fn disconnected_device_is_unavailable_too() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let mut device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;

    // Device drops; the registry record stays, disconnected.
    device.close();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = broker.registry().get("scope-1").await.expect("record kept");
    assert!(!record.connected);

    let command = Envelope::command("scope-1", "goto", serde_json::Map::new());
    client.send(&command);

    let error = client.recv_until(MessageType::Error).await;
    let Payload::Error(err) = &error.payload else {
        panic!("expected Error payload");
    };
    assert_eq!(err.error_code, error_codes::DEVICE_UNAVAILABLE);

    broker.stop().await;
}
