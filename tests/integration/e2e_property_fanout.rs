/// Property-change synthesis and fan-out: the router diffs Response
/// properties against the registry cache and notifies subscribers
/// exactly once per observed transition.
use skybus::core::{Broker, BrokerConfig};
use skybus::protocol::{Envelope, MessageType, Payload, PROPERTY_CHANGED_EVENT};
use skybus_test_utils::{attach_client, attach_device};
use std::time::Duration;

fn quiet_config() -> BrokerConfig {
    let mut cfg = BrokerConfig::open();
    cfg.heartbeat_interval_secs = 0;
    cfg
}

fn subscribe_property(device: &str, property: &str) -> Envelope {
    let mut params = serde_json::Map::new();
    params.insert("device".to_owned(), serde_json::json!(device));
    params.insert("property".to_owned(), serde_json::json!(property));
    Envelope::command("", "subscribe_property", params)
}

fn unsubscribe_property(device: &str, property: &str) -> Envelope {
    let mut params = serde_json::Map::new();
    params.insert("device".to_owned(), serde_json::json!(device));
    params.insert("property".to_owned(), serde_json::json!(property));
    Envelope::command("", "unsubscribe_property", params)
}

/// Send a command from `client`, answer it from `device` with the given
/// property value, and wait for the response to come back.
async fn respond_with_temperature(
    client: &mut skybus_test_utils::MockRemote,
    device: &mut skybus_test_utils::MockRemote,
    value: i64,
) {
    let command = Envelope::command("scope-1", "status", serde_json::Map::new());
    client.send(&command);
    let delivered = device.recv_until(MessageType::Command).await;

    let mut response = Envelope::response_to(&delivered, "OK");
    if let Payload::Response(resp) = &mut response.payload {
        let mut props = serde_json::Map::new();
        props.insert("temperature".to_owned(), serde_json::json!(value));
        resp.properties = Some(props);
    }
    device.send(&response);
    client.recv_until(MessageType::Response).await;
}

#[tokio::test]
async fn second_transition_fans_out_exactly_once() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let mut device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;
    let (_sub_id, mut subscriber) = attach_client(&broker).await;

    subscriber.send(&subscribe_property("scope-1", "temperature"));
    subscriber.recv_until(MessageType::Response).await;

    // Registry starts with no prior value: the first observation seeds
    // the cache silently, the second is a transition.
    respond_with_temperature(&mut client, &mut device, 10).await;
    respond_with_temperature(&mut client, &mut device, 11).await;

    let event = subscriber.recv_until(MessageType::Event).await;
    let Payload::Event(ev) = &event.payload else {
        panic!("expected Event payload");
    };
    assert_eq!(ev.event, PROPERTY_CHANGED_EVENT);
    let details = ev.details.as_ref().expect("details");
    assert_eq!(details["property"], serde_json::json!("temperature"));
    assert_eq!(details["value"], serde_json::json!(11));
    assert_eq!(details["previous"], serde_json::json!(10));

    // Exactly one event: the seed produced nothing.
    assert!(subscriber
        .recv_timeout(Duration::from_millis(200))
        .await
        .is_none());
    assert_eq!(
        broker.registry().get_property("scope-1", "temperature").await,
        Some(serde_json::json!(11))
    );

    broker.stop().await;
}

#[tokio::test]
async fn one_unsubscribe_undoes_repeated_subscribes() {
    let broker = Broker::new(quiet_config());
    broker.start().await;

    let mut device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;
    let (_sub_id, mut subscriber) = attach_client(&broker).await;

    // Subscribe three times: idempotent, one record.
    for _ in 0..3 {
        subscriber.send(&subscribe_property("scope-1", "temperature"));
        subscriber.recv_until(MessageType::Response).await;
    }
    assert_eq!(broker.subscriptions().count().await, 1);

    subscriber.send(&unsubscribe_property("scope-1", "temperature"));
    subscriber.recv_until(MessageType::Response).await;
    assert_eq!(broker.subscriptions().count().await, 0);

    // Transitions no longer reach the former subscriber.
    respond_with_temperature(&mut client, &mut device, 10).await;
    respond_with_temperature(&mut client, &mut device, 11).await;
    assert!(subscriber
        .recv_timeout(Duration::from_millis(200))
        .await
        .is_none());

    broker.stop().await;
}
