/// Recovery strategies applied to device-reported errors, on top of
/// their normal delivery to the originating client.
use skybus::core::recovery::RecoveryStrategy;
use skybus::core::{Broker, BrokerConfig};
use skybus::protocol::{
    Envelope, MessageType, Payload, DEVICE_FAILOVER_EVENT, ERROR_NOTICE_EVENT,
};
use skybus_test_utils::{attach_client, attach_device};
use std::time::Duration;

fn quiet_config() -> BrokerConfig {
    let mut cfg = BrokerConfig::open();
    cfg.heartbeat_interval_secs = 0;
    cfg
}

fn subscribe_event(device: &str, event: &str) -> Envelope {
    let mut params = serde_json::Map::new();
    params.insert("device".to_owned(), serde_json::json!(device));
    params.insert("event".to_owned(), serde_json::json!(event));
    Envelope::command("", "subscribe_event", params)
}

#[tokio::test]
async fn notify_strategy_fans_out_an_error_notice() {
    let broker = Broker::new(quiet_config());
    broker.start().await;
    broker
        .recovery()
        .set_strategy("MOTOR_STALL", RecoveryStrategy::Notify)
        .await;

    let mut device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;
    let (_sub_id, mut subscriber) = attach_client(&broker).await;

    subscriber.send(&subscribe_event("scope-1", ERROR_NOTICE_EVENT));
    subscriber.recv_until(MessageType::Response).await;

    // Client command; the device answers with an Error.
    let command = Envelope::command("scope-1", "goto", serde_json::Map::new());
    client.send(&command);
    let delivered = device.recv_until(MessageType::Command).await;
    let mut failure = Envelope::error_to(&delivered, "MOTOR_STALL", "declination axis stalled");
    failure.device_id = Some("scope-1".to_owned());
    device.send(&failure);

    // Normal delivery: the client sees the device's error.
    let received = client.recv_until(MessageType::Error).await;
    assert_eq!(
        received.original_message_id.as_deref(),
        Some(command.message_id.as_str())
    );

    // Recovery detour: subscribers get the notice event.
    let notice = subscriber.recv_until(MessageType::Event).await;
    let Payload::Event(ev) = &notice.payload else {
        panic!("expected Event payload");
    };
    assert_eq!(ev.event, ERROR_NOTICE_EVENT);
    assert_eq!(
        ev.details.as_ref().expect("details")["errorCode"],
        serde_json::json!("MOTOR_STALL")
    );

    let history = broker.recovery().history(10).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].error_code, "MOTOR_STALL");

    broker.stop().await;
}

#[tokio::test]
async fn failover_strategy_marks_the_device_down() {
    let broker = Broker::new(quiet_config());
    broker.start().await;
    broker
        .recovery()
        .set_device_strategy("scope-1", "POWER_LOSS", RecoveryStrategy::Failover)
        .await;

    let device = attach_device(&broker, "scope-1", "telescope").await;
    let (_sub_id, mut subscriber) = attach_client(&broker).await;
    subscriber.send(&subscribe_event("scope-1", DEVICE_FAILOVER_EVENT));
    subscriber.recv_until(MessageType::Response).await;

    // A standalone device error, not tied to any command.
    let mut failure = Envelope::error("POWER_LOSS", "mount power supply dropped");
    failure.device_id = Some("scope-1".to_owned());
    device.send(&failure);

    let event = subscriber.recv_until(MessageType::Event).await;
    let Payload::Event(ev) = &event.payload else {
        panic!("expected Event payload");
    };
    assert_eq!(ev.event, DEVICE_FAILOVER_EVENT);
    assert!(!broker.registry().is_connected("scope-1").await);

    broker.stop().await;
}

#[tokio::test]
async fn restart_strategy_sends_a_reset_command() {
    let broker = Broker::new(quiet_config());
    broker.start().await;
    broker
        .recovery()
        .set_strategy("FIRMWARE_WEDGED", RecoveryStrategy::RestartDevice)
        .await;

    let mut device = attach_device(&broker, "scope-1", "telescope").await;

    let mut failure = Envelope::error("FIRMWARE_WEDGED", "command processor hung");
    failure.device_id = Some("scope-1".to_owned());
    device.send(&failure);

    let reset = device.recv_until(MessageType::Command).await;
    let Payload::Command(cmd) = &reset.payload else {
        panic!("expected Command payload");
    };
    assert_eq!(cmd.command, "reset");

    broker.stop().await;
}

#[tokio::test]
async fn retry_strategy_resends_the_original_command() {
    let broker = Broker::new(quiet_config());
    broker.start().await;
    broker
        .recovery()
        .set_strategy("TRANSIENT", RecoveryStrategy::Retry)
        .await;

    let mut device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;

    let command = Envelope::command("scope-1", "goto", serde_json::Map::new());
    client.send(&command);
    let first = device.recv_until(MessageType::Command).await;
    device.send(&Envelope::error_to(&first, "TRANSIENT", "try again"));

    // The client is told; the command is re-driven at the device.
    client.recv_until(MessageType::Error).await;
    let retried = device.recv_until(MessageType::Command).await;
    assert_eq!(retried.message_id, command.message_id);

    // This time it works and the client gets the response.
    device.send(&Envelope::response_to(&retried, "OK"));
    let response = client.recv_until(MessageType::Response).await;
    assert_eq!(
        response.original_message_id.as_deref(),
        Some(command.message_id.as_str())
    );

    // Give fan-out and bookkeeping a beat, then confirm nothing leaks.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.router().pending_len().await, 0);

    broker.stop().await;
}
