/// Registration/Discovery: registered devices appear in discovery
/// listings, honoring the type filter and correlating to the request.
use skybus::core::{Broker, BrokerConfig};
use skybus::protocol::{Envelope, MessageType, Payload};
use skybus_test_utils::{attach_client, attach_device};

fn quiet_config() -> BrokerConfig {
    let mut cfg = BrokerConfig::open();
    cfg.heartbeat_interval_secs = 0;
    cfg
}

#[tokio::test]
async fn registration_then_discovery_lists_the_device() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let _scope = attach_device(&broker, "scope-1", "telescope").await;
    let _camera = attach_device(&broker, "cam-1", "camera").await;
    let (_client_id, mut client) = attach_client(&broker).await;

    // Matching filter returns the device.
    let request = Envelope::discovery_request(vec!["telescope".to_owned()]);
    client.send(&request);
    let reply = client.recv_until(MessageType::DiscoveryResponse).await;
    assert_eq!(
        reply.original_message_id.as_deref(),
        Some(request.message_id.as_str())
    );
    let Payload::DiscoveryResponse(listing) = &reply.payload else {
        panic!("expected DiscoveryResponse payload");
    };
    assert_eq!(listing.devices.len(), 1);
    assert_eq!(listing.devices["scope-1"].device_type, "telescope");

    // Empty filter returns everything.
    client.send(&Envelope::discovery_request(vec![]));
    let reply = client.recv_until(MessageType::DiscoveryResponse).await;
    let Payload::DiscoveryResponse(listing) = &reply.payload else {
        panic!("expected DiscoveryResponse payload");
    };
    assert_eq!(listing.devices.len(), 2);

    // Non-matching filter returns nothing.
    client.send(&Envelope::discovery_request(vec!["rotator".to_owned()]));
    let reply = client.recv_until(MessageType::DiscoveryResponse).await;
    let Payload::DiscoveryResponse(listing) = &reply.payload else {
        panic!("expected DiscoveryResponse payload");
    };
    assert!(listing.devices.is_empty());

    broker.stop().await;
}
