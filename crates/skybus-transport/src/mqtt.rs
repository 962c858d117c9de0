//! MQTT adaptor over `rumqttc`.
//!
//! The broker side is itself an MQTT client of an external MQTT broker.
//! Devices publish their envelopes under the fixed topic schema
//!
//! ```text
//! astrocomm/device/{id}/command        broker → device
//! astrocomm/device/{id}/status         device → broker (retained)
//! astrocomm/device/{id}/event/<name>   device → broker
//! astrocomm/device/{id}/data/<name>    device → broker
//! ```
//!
//! and the adaptor turns each device id seen on the wire into one peer
//! session, so MQTT devices are indistinguishable from TCP or WebSocket
//! ones once past the transport layer.  MQTT's native QoS levels map
//! 1:1 onto the envelope's own QoS field for the publish leg; end-to-end
//! ack semantics stay with the core (a Response still acknowledges a
//! Command regardless of what the MQTT broker did).
//!
//! Payloads are envelope JSON verbatim.  Retained delivery is used only
//! for `status`, so late subscribers see the last known device state.

use crate::{TransportError, TransportConfig};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use skybus_core::link::{FrameSink, FrameSource, IncomingLink, LinkError, LinkMeta, TransportKind};
use skybus_core::Broker;
use skybus_protocol::{decode, Payload};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Topic root shared with the original wire contract.
pub const TOPIC_PREFIX: &str = "astrocomm/device";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Username/password for the external MQTT broker, if it wants any.
    pub credentials: Option<(String, String)>,
}

impl MqttConfig {
    pub fn new(broker_host: impl Into<String>, broker_port: u16) -> Self {
        MqttConfig {
            broker_host: broker_host.into(),
            broker_port,
            client_id: format!("skybus-{}", uuid::Uuid::new_v4()),
            keep_alive: Duration::from_secs(30),
            credentials: None,
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        crate::validate_endpoint(&self.broker_host)?;
        if self.client_id.is_empty() {
            return Err(TransportError::Config("client_id must not be empty".into()));
        }
        Ok(())
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.broker_host, self.broker_port);
        options.set_keep_alive(self.keep_alive);
        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username, password);
        }
        options
    }
}

// ---------------------------------------------------------------------------
// Topic schema
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum TopicKind {
    Command,
    Status,
    Event(String),
    Data(String),
}

fn parse_topic(topic: &str) -> Option<(String, TopicKind)> {
    let rest = topic.strip_prefix(TOPIC_PREFIX)?.strip_prefix('/')?;
    let (device_id, tail) = rest.split_once('/')?;
    if device_id.is_empty() {
        return None;
    }
    let kind = match tail.split_once('/') {
        None => match tail {
            "command" => TopicKind::Command,
            "status" => TopicKind::Status,
            _ => return None,
        },
        Some(("event", name)) if !name.is_empty() => TopicKind::Event(name.to_owned()),
        Some(("data", name)) if !name.is_empty() => TopicKind::Data(name.to_owned()),
        _ => return None,
    };
    Some((device_id.to_owned(), kind))
}

/// Topic an outbound envelope belongs on, derived from its type.
fn outbound_topic(device_id: &str, frame: &[u8]) -> (String, bool) {
    let (suffix, retain) = match decode(frame) {
        Ok(envelope) => match &envelope.payload {
            Payload::Command(_) => ("command".to_owned(), false),
            Payload::Event(ev) => (format!("event/{}", ev.event), false),
            _ => ("status".to_owned(), true),
        },
        // Undecodable frames still need somewhere to go; status is the
        // catch-all channel.
        Err(_) => ("status".to_owned(), false),
    };
    (format!("{}/{}/{}", TOPIC_PREFIX, device_id, suffix), retain)
}

fn publish_qos(frame: &[u8]) -> QoS {
    match decode(frame).map(|e| e.qos) {
        Ok(skybus_protocol::QoS::AtMostOnce) => QoS::AtMostOnce,
        Ok(skybus_protocol::QoS::AtLeastOnce) => QoS::AtLeastOnce,
        Ok(skybus_protocol::QoS::ExactlyOnce) => QoS::ExactlyOnce,
        Err(_) => QoS::AtMostOnce,
    }
}

// ---------------------------------------------------------------------------
// Framed halves
// ---------------------------------------------------------------------------

struct MqttSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for MqttSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        Ok(self.rx.recv().await)
    }
}

struct MqttSink {
    client: AsyncClient,
    device_id: String,
    max_frame: usize,
}

#[async_trait]
impl FrameSink for MqttSink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if frame.len() > self.max_frame {
            return Err(LinkError::FrameTooLarge(frame.len()));
        }
        let (topic, retain) = outbound_topic(&self.device_id, frame);
        self.client
            .publish(topic, publish_qos(frame), retain, frame.to_vec())
            .await
            .map_err(|e| LinkError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        // The shared client stays up for the other device links.
    }
}

// ---------------------------------------------------------------------------
// Broker side
// ---------------------------------------------------------------------------

struct ServerHandle {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// Bridges MQTT-connected devices into broker sessions, one per device
/// id observed on the subscribed topics.
pub struct MqttServerTransport {
    cfg: MqttConfig,
    transport: TransportConfig,
    running: Mutex<Option<ServerHandle>>,
}

impl MqttServerTransport {
    pub fn new(cfg: MqttConfig, transport: TransportConfig) -> Result<Self, TransportError> {
        cfg.validate()?;
        transport.validate()?;
        Ok(MqttServerTransport {
            cfg,
            transport,
            running: Mutex::new(None),
        })
    }

    /// Connect to the external MQTT broker and start attaching device
    /// sessions.  Idempotent.
    pub async fn start(&self, broker: Broker) -> Result<(), TransportError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let (client, mut eventloop) = AsyncClient::new(self.cfg.options(), 64);
        let subscriber = client.clone();
        let host = self.cfg.broker_host.clone();
        let max_frame = self.transport.max_message_size;

        let task = tokio::spawn(async move {
            info!(host = %host, "mqtt transport running");
            let mut links: HashMap<String, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // (Re)connected: subscriptions do not survive a
                        // reconnect, so install them every time.
                        for suffix in ["status", "event/+", "data/+"] {
                            let filter = format!("{}/+/{}", TOPIC_PREFIX, suffix);
                            if let Err(e) =
                                subscriber.subscribe(filter, QoS::AtLeastOnce).await
                            {
                                warn!(error = %e, "mqtt subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some((device_id, kind)) = parse_topic(&publish.topic) else {
                            debug!(topic = %publish.topic, "ignoring off-schema topic");
                            continue;
                        };
                        if kind == TopicKind::Command {
                            // Our own outbound leg; not device traffic.
                            continue;
                        }
                        if publish.payload.len() > max_frame {
                            warn!(device_id = %device_id, "oversized mqtt payload dropped");
                            continue;
                        }
                        deliver(
                            &broker,
                            &subscriber,
                            &mut links,
                            &host,
                            &device_id,
                            max_frame,
                            publish.payload.to_vec(),
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt connection error, retrying");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        *running = Some(ServerHandle { client, task });
        Ok(())
    }

    /// Disconnect from the external broker.  Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.running.lock().await.take() {
            let _ = handle.client.disconnect().await;
            handle.task.abort();
            info!("mqtt transport stopped");
        }
    }
}

/// Route one inbound payload to its device link, attaching a fresh
/// session for ids we have not seen (or whose session has closed).
async fn deliver(
    broker: &Broker,
    client: &AsyncClient,
    links: &mut HashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
    host: &str,
    device_id: &str,
    max_frame: usize,
    payload: Vec<u8>,
) {
    if let Some(tx) = links.get(device_id) {
        if tx.send(payload.clone()).is_ok() {
            return;
        }
        // Session ended; fall through to drop the stale sender and
        // attach a fresh one.
    }
    links.remove(device_id);

    let (tx, rx) = mpsc::unbounded_channel();
    let meta = LinkMeta::new(TransportKind::Mqtt)
        .with_remote(format!("mqtt://{}/{}", host, device_id));
    broker
        .attach_link(IncomingLink {
            meta,
            source: Box::new(MqttSource { rx }),
            sink: Box::new(MqttSink {
                client: client.clone(),
                device_id: device_id.to_owned(),
                max_frame,
            }),
        })
        .await;
    let _ = tx.send(payload);
    links.insert(device_id.to_owned(), tx);
}

// ---------------------------------------------------------------------------
// Device role
// ---------------------------------------------------------------------------

/// Connect as one MQTT device: subscribe to the device's command topic
/// and surface a link whose outbound half publishes to the device's
/// status/event topics.
pub async fn connect_mqtt_device(
    cfg: &MqttConfig,
    transport: &TransportConfig,
    device_id: &str,
) -> Result<IncomingLink, TransportError> {
    cfg.validate()?;
    transport.validate()?;
    if device_id.is_empty() {
        return Err(TransportError::Config("device_id must not be empty".into()));
    }

    let (client, mut eventloop) = AsyncClient::new(cfg.options(), 64);
    let (tx, rx) = mpsc::unbounded_channel();
    let command_topic = format!("{}/{}/command", TOPIC_PREFIX, device_id);
    let subscriber = client.clone();

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Err(e) = subscriber
                        .subscribe(command_topic.clone(), QoS::AtLeastOnce)
                        .await
                    {
                        warn!(error = %e, "mqtt command subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if tx.send(publish.payload.to_vec()).is_err() {
                        // Link consumer is gone; stop polling.
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    Ok(IncomingLink {
        meta: LinkMeta::new(TransportKind::Mqtt)
            .with_remote(format!("mqtt://{}:{}", cfg.broker_host, cfg.broker_port)),
        source: Box::new(MqttSource { rx }),
        sink: Box::new(MqttSink {
            client,
            device_id: device_id.to_owned(),
            max_frame: transport.max_message_size,
        }),
    })
}

// ---------------------------------------------------------------------------
// Tests (topic schema only; live traffic needs an external broker)
// ---------------------------------------------------------------------------
