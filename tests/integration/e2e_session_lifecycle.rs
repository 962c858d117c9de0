/// Session lifecycle: duplicate registration tie-breaks, disconnect
/// cleanup, decode-failure policy, and command filtering.
use skybus::core::{Broker, BrokerConfig};
use skybus::protocol::{error_codes, Envelope, DeviceInfo, MessageType, Payload};
use skybus_test_utils::{attach_client, attach_device, mock_link};
use std::time::Duration;

fn quiet_config() -> BrokerConfig {
    let mut cfg = BrokerConfig::open();
    cfg.heartbeat_interval_secs = 0;
    cfg
}

#[tokio::test]
async fn duplicate_registration_loses_while_the_first_session_lives() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let mut first = attach_device(&broker, "scope-1", "telescope").await;

    // Second session tries the same id while the first is live.
    let (link, mut second) = mock_link();
    broker.attach_link(link).await;
    second.send(&Envelope::registration(DeviceInfo::new(
        "scope-1",
        "telescope",
    )));
    let reply = second.recv_until(MessageType::Error).await;
    let Payload::Error(err) = &reply.payload else {
        panic!("expected Error payload");
    };
    assert_eq!(err.error_code, error_codes::DUPLICATE_REGISTRATION);

    // Once the first session closes, the same id registers cleanly.
    first.close();
    tokio::time::sleep(Duration::from_millis(100)).await;
    second.send(&Envelope::registration(DeviceInfo::new(
        "scope-1",
        "telescope",
    )));
    second.recv_until(MessageType::Response).await;
    assert!(broker.registry().is_connected("scope-1").await);

    broker.stop().await;
}

#[tokio::test]
async fn disconnect_purges_subscriptions_and_presence() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let _device = attach_device(&broker, "scope-1", "telescope").await;
    let (_sub_id, mut subscriber) = attach_client(&broker).await;

    let mut params = serde_json::Map::new();
    params.insert("device".to_owned(), serde_json::json!("scope-1"));
    params.insert("event".to_owned(), serde_json::json!("slew_done"));
    subscriber.send(&Envelope::command("", "subscribe_event", params));
    subscriber.recv_until(MessageType::Response).await;
    assert_eq!(broker.subscriptions().count().await, 1);

    subscriber.close();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.subscriptions().count().await, 0);

    broker.stop().await;
}

#[tokio::test]
async fn garbage_frames_get_an_error_then_close_the_session() {
    let mut cfg = quiet_config();
    cfg.max_decode_failures = 3;
    let broker = Broker::new(cfg);
    broker.start().await;

    let (_peer, mut remote) = attach_client(&broker).await;

    remote.send_frame(b"not json at all".to_vec());
    let reply = remote.recv_until(MessageType::Error).await;
    let Payload::Error(err) = &reply.payload else {
        panic!("expected Error payload");
    };
    assert_eq!(err.error_code, error_codes::INVALID_ENVELOPE);

    // A valid envelope resets the failure streak.
    remote.send(&Envelope::discovery_request(vec![]));
    remote.recv_until(MessageType::DiscoveryResponse).await;

    // Three consecutive failures exhaust the tolerance.
    for _ in 0..3 {
        remote.send_frame(b"{broken".to_vec());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.session_count().await, 0);

    broker.stop().await;
}

#[tokio::test]
async fn command_filtering_rejects_anything_off_list() {
    let mut cfg = quiet_config();
    cfg.enable_command_filtering = true;
    cfg.allowed_commands.insert("goto".to_owned());
    let broker = Broker::new(cfg);
    broker.start().await;

    let mut device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;

    client.send(&Envelope::command(
        "scope-1",
        "format_disk",
        serde_json::Map::new(),
    ));
    let reply = client.recv_until(MessageType::Error).await;
    let Payload::Error(err) = &reply.payload else {
        panic!("expected Error payload");
    };
    assert_eq!(err.error_code, error_codes::UNSUPPORTED_COMMAND);

    // The allowed command still routes.
    client.send(&Envelope::command("scope-1", "goto", serde_json::Map::new()));
    device.recv_until(MessageType::Command).await;

    broker.stop().await;
}

#[tokio::test]
async fn heartbeats_reach_live_sessions() {
    let mut cfg = quiet_config();
    cfg.heartbeat_interval_secs = 1;
    let broker = Broker::new(cfg);
    broker.start().await;

    let (_peer, mut remote) = attach_client(&broker).await;
    // Become Live with any first envelope.
    remote.send(&Envelope::discovery_request(vec![]));
    remote.recv_until(MessageType::DiscoveryResponse).await;

    let event = remote.recv_until(MessageType::Event).await;
    let Payload::Event(ev) = &event.payload else {
        panic!("expected Event payload");
    };
    assert_eq!(ev.event, "heartbeat");

    broker.stop().await;
}

#[tokio::test]
async fn broker_ping_answers_ok() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let (_peer, mut remote) = attach_client(&broker).await;
    let ping = Envelope::command("", "ping", serde_json::Map::new());
    remote.send(&ping);
    let reply = remote.recv_until(MessageType::Response).await;
    assert_eq!(
        reply.original_message_id.as_deref(),
        Some(ping.message_id.as_str())
    );

    broker.stop().await;
}
