/// AtLeastOnce delivery against a device whose writer is failing:
/// bounded retries with exponential backoff, then a TIMEOUT error back
/// to the sender and a clean pending map.
use skybus::core::{Broker, BrokerConfig};
use skybus::protocol::{error_codes, Envelope, MessageType, Payload, QoS};
use skybus_test_utils::{attach_client, attach_device};
use std::time::Duration;

fn retry_config() -> BrokerConfig {
    let mut cfg = BrokerConfig::open();
    cfg.heartbeat_interval_secs = 0;
    cfg.retry.base = Duration::from_millis(50);
    cfg.retry.max_attempts = 2;
    cfg.retry.jitter = 0.0;
    // Keep the router deadline out of the way so the queue's own retry
    // exhaustion is what surfaces.
    cfg.pending_response_timeout_ms = 5_000;
    cfg
}

#[tokio::test]
async fn write_failures_retry_then_surface_timeout() {
    let broker = Broker::new(retry_config());
    broker.start().await;

    let device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;

    // Pause the device's writer: every frame write now fails.
    device.set_fail_writes(true);

    let started = std::time::Instant::now();
    let command =
        Envelope::command("scope-1", "goto", serde_json::Map::new()).with_qos(QoS::AtLeastOnce);
    client.send(&command);

    // Initial attempt + retries at ~50ms and ~100ms, then failure.
    let error = client.recv_until(MessageType::Error).await;
    let elapsed = started.elapsed();
    let Payload::Error(err) = &error.payload else {
        panic!("expected Error payload");
    };
    assert_eq!(err.error_code, error_codes::TIMEOUT);
    assert_eq!(
        error.original_message_id.as_deref(),
        Some(command.message_id.as_str())
    );
    assert!(
        elapsed >= Duration::from_millis(150),
        "failed too early: {:?}",
        elapsed
    );

    // The correlation is gone; a late response would be dropped.
    assert_eq!(broker.router().pending_len().await, 0);

    broker.stop().await;
}

#[tokio::test]
async fn recovered_writer_lets_a_retry_through() {
    let broker = Broker::new(retry_config());
    broker.start().await;

    let mut device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;

    // First attempt fails, then the link recovers before the retry.
    device.set_fail_writes(true);
    let command =
        Envelope::command("scope-1", "goto", serde_json::Map::new()).with_qos(QoS::AtLeastOnce);
    client.send(&command);
    tokio::time::sleep(Duration::from_millis(20)).await;
    device.set_fail_writes(false);

    let delivered = device.recv_until(MessageType::Command).await;
    assert_eq!(delivered.message_id, command.message_id);
    device.send(&Envelope::response_to(&delivered, "OK"));

    let response = client.recv_until(MessageType::Response).await;
    assert_eq!(
        response.original_message_id.as_deref(),
        Some(command.message_id.as_str())
    );

    broker.stop().await;
}
