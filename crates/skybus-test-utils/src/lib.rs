//! Test utilities: in-memory broker links and scripted peers.
//!
//! `mock_link()` builds a link whose far end is a [`MockRemote`] the
//! test controls directly — feed frames in, read the broker's writes
//! out, flip write failures on and off.  The attach helpers wrap the
//! common session setups (a registered device, a plain client).

mod mock_link;

pub use mock_link::{mock_link, MockRemote};

use skybus_core::Broker;
use skybus_protocol::{DeviceInfo, Envelope, MessageType};
use std::time::Duration;

/// Attach a plain client session to the broker.  Assumes an open
/// (auth-disabled) broker config.
pub async fn attach_client(broker: &Broker) -> (String, MockRemote) {
    let (link, remote) = mock_link();
    let peer_id = broker.attach_link(link).await;
    (peer_id, remote)
}

/// Attach and register a device session, consuming the registration
/// acknowledgement.  Panics if the broker does not acknowledge.
pub async fn attach_device(broker: &Broker, id: &str, device_type: &str) -> MockRemote {
    let (link, mut remote) = mock_link();
    broker.attach_link(link).await;

    let registration = Envelope::registration(DeviceInfo::new(id, device_type));
    remote.send(&registration);
    let ack = remote
        .recv_timeout(Duration::from_secs(1))
        .await
        .unwrap_or_else(|| panic!("no registration ack for '{}'", id));
    assert_eq!(ack.message_type(), MessageType::Response, "ack: {:?}", ack);
    remote
}

/// Drive a device that answers every Command with an OK Response.
/// Returns when the remote closes.
pub async fn run_echo_device(mut remote: MockRemote) {
    while let Some(envelope) = remote.recv().await {
        if envelope.message_type() == MessageType::Command {
            remote.send(&Envelope::response_to(&envelope, "OK"));
        }
    }
}
