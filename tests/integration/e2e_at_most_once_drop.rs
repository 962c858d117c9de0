/// AtMostOnce semantics: a write failure destroys the entry with no
/// retry and no error back to the sender, and the router's pending map
/// is cleaned silently.
use skybus::core::{Broker, BrokerConfig};
use skybus::protocol::{Envelope, QoS};
use skybus_test_utils::{attach_client, attach_device};
use std::time::Duration;

#[tokio::test]
async fn failed_write_is_dropped_silently() {
    let mut cfg = BrokerConfig::open();
    cfg.heartbeat_interval_secs = 0;
    // Short router deadline: if the pending entry were NOT cleaned on
    // the drop, a TIMEOUT error would arrive within the wait below.
    cfg.pending_response_timeout_ms = 200;
    let broker = Broker::new(cfg);
    broker.start().await;

    let device = attach_device(&broker, "scope-1", "telescope").await;
    let (_client_id, mut client) = attach_client(&broker).await;

    device.set_fail_writes(true);
    let command =
        Envelope::command("scope-1", "goto", serde_json::Map::new()).with_qos(QoS::AtMostOnce);
    client.send(&command);

    // No retry, no error — silence is the contract.
    assert!(client.recv_timeout(Duration::from_millis(600)).await.is_none());
    assert_eq!(broker.router().pending_len().await, 0);

    // The device session survived the failed write.
    assert!(broker.registry().is_connected("scope-1").await);

    broker.stop().await;
}
