/// Authentication over the wire: denial, success, and the sliding
/// failure window that turns repeated failures into RATE_LIMITED
/// without consulting the credential tables.
use skybus::core::auth::basic_credentials;
use skybus::core::config::UserCredential;
use skybus::core::{Broker, BrokerConfig};
use skybus::protocol::{error_codes, AuthMethod, Envelope, MessageType, Payload};
use skybus_test_utils::attach_client;

fn auth_config(max_failed_attempts: u32) -> BrokerConfig {
    let mut cfg = BrokerConfig::default();
    cfg.heartbeat_interval_secs = 0;
    cfg.auth.max_failed_attempts = max_failed_attempts;
    cfg.auth.rate_limit_duration_minutes = 15;
    cfg.auth.users.push(UserCredential {
        username: "astronomer".to_owned(),
        password: "orion".to_owned(),
    });
    cfg
}

async fn attempt_basic(broker: &Broker, password: &str) -> Envelope {
    let (_peer, mut remote) = attach_client(broker).await;
    remote.send(&Envelope::authentication(
        AuthMethod::Basic,
        basic_credentials("astronomer", password),
    ));
    remote
        .recv_timeout(std::time::Duration::from_secs(1))
        .await
        .expect("an auth reply")
}

#[tokio::test]
async fn tenth_failure_rate_limits_the_eleventh_attempt() {
    let broker = Broker::new(auth_config(10));
    broker.start().await;

    for attempt in 0..10 {
        let reply = attempt_basic(&broker, "wrong").await;
        let Payload::Error(err) = &reply.payload else {
            panic!("attempt {}: expected Error, got {:?}", attempt, reply);
        };
        assert_eq!(err.error_code, error_codes::UNAUTHENTICATED);
    }

    // Window full: even the correct password is refused unchecked.
    let reply = attempt_basic(&broker, "orion").await;
    let Payload::Error(err) = &reply.payload else {
        panic!("expected Error, got {:?}", reply);
    };
    assert_eq!(err.error_code, error_codes::RATE_LIMITED);

    broker.stop().await;
}

#[tokio::test]
async fn successful_auth_unlocks_the_session() {
    let broker = Broker::new(auth_config(5));
    broker.start().await;

    let (_peer, mut remote) = attach_client(&broker).await;
    let auth = Envelope::authentication(
        AuthMethod::Basic,
        basic_credentials("astronomer", "orion"),
    );
    remote.send(&auth);
    let reply = remote.recv_until(MessageType::Response).await;
    assert_eq!(
        reply.original_message_id.as_deref(),
        Some(auth.message_id.as_str())
    );

    // The session is live: discovery works.
    remote.send(&Envelope::discovery_request(vec![]));
    remote.recv_until(MessageType::DiscoveryResponse).await;

    broker.stop().await;
}

#[tokio::test]
async fn commands_before_authentication_are_rejected() {
    let broker = Broker::new(auth_config(5));
    broker.start().await;

    let (_peer, mut remote) = attach_client(&broker).await;
    remote.send(&Envelope::command(
        "scope-1",
        "goto",
        serde_json::Map::new(),
    ));

    let reply = remote.recv_until(MessageType::Error).await;
    let Payload::Error(err) = &reply.payload else {
        panic!("expected Error payload");
    };
    assert_eq!(err.error_code, error_codes::UNAUTHENTICATED);

    broker.stop().await;
}
