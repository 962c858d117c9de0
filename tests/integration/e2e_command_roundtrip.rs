/// Happy-path command routing: client → broker → device → broker →
/// client, with the device's response correlated back by
/// `originalMessageId`.
use skybus::core::{Broker, BrokerConfig};
use skybus::protocol::{Envelope, MessageType, Payload, QoS};
use skybus_test_utils::{attach_client, attach_device};
use std::time::Duration;

fn quiet_config() -> BrokerConfig {
    let mut cfg = BrokerConfig::open();
    cfg.heartbeat_interval_secs = 0;
    cfg
}

#[tokio::test]
async fn command_and_response_round_trip() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let mut device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;

    let mut params = serde_json::Map::new();
    params.insert("target".to_owned(), serde_json::json!("M31"));
    let command = Envelope::command("scope-1", "goto", params).with_qos(QoS::AtLeastOnce);
    client.send(&command);

    // The device sees the exact command.
    let delivered = device.recv_until(MessageType::Command).await;
    assert_eq!(delivered.message_id, command.message_id);
    let Payload::Command(cmd) = &delivered.payload else {
        panic!("expected Command payload");
    };
    assert_eq!(cmd.command, "goto");

    // Device answers; the client gets the same response envelope.
    let response = Envelope::response_to(&delivered, "OK");
    device.send(&response);

    let received = client.recv_until(MessageType::Response).await;
    assert_eq!(received.message_id, response.message_id);
    assert_eq!(
        received.original_message_id.as_deref(),
        Some(command.message_id.as_str())
    );
    let Payload::Response(resp) = &received.payload else {
        panic!("expected Response payload");
    };
    assert_eq!(resp.status, "OK");

    // Registry shows the device connected; no stray errors anywhere.
    assert!(broker.registry().is_connected("scope-1").await);
    assert!(client.try_recv().is_none());
    assert_eq!(broker.router().pending_len().await, 0);

    // Session counters saw the traffic (registration + command in,
    // ack for the AtLeastOnce command).
    let device_session = broker.session("scope-1").await.expect("device session");
    assert!(device_session.counters.received() >= 2);
    assert_eq!(device_session.counters.acknowledged(), 1);

    broker.stop().await;
}

#[tokio::test]
async fn uncorrelated_responses_are_dropped_with_a_counter() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let device = attach_device(&broker, "scope-1", "telescope").await;
    let mut stray = Envelope::new(skybus::protocol::Payload::Response(Default::default()));
    stray.original_message_id = Some("never-sent".to_owned());
    device.send(&stray);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.router().uncorrelated_drops(), 1);

    broker.stop().await;
}

#[tokio::test]
async fn exactly_once_duplicates_reach_the_device_once() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let mut device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;

    let command =
        Envelope::command("scope-1", "park", serde_json::Map::new()).with_qos(QoS::ExactlyOnce);
    // A retrying sender delivers the same envelope twice.
    client.send(&command);
    client.send(&command);

    let first = device.recv_until(MessageType::Command).await;
    assert_eq!(first.message_id, command.message_id);
    device.send(&Envelope::response_to(&first, "OK"));

    client.recv_until(MessageType::Response).await;
    // No second copy arrives at the device.
    assert!(device.recv_timeout(Duration::from_millis(200)).await.is_none());
    assert_eq!(broker.counters().duplicates_dropped(), 1);

    broker.stop().await;
}
