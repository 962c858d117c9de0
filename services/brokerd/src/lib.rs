//! Broker daemon assembly: config → broker + transports.

pub mod config;
pub mod persistence;

use crate::config::BrokerdConfig;
use crate::persistence::JsonFileStore;
use skybus_core::Broker;
use skybus_transport::mqtt::MqttServerTransport;
use skybus_transport::tcp::TcpServerTransport;
use skybus_transport::ws::WsServerTransport;
use skybus_transport::TransportConfig;
use std::sync::Arc;
use tracing::info;

/// Everything a running daemon holds.
pub struct Daemon {
    pub broker: Broker,
    tcp: Option<TcpServerTransport>,
    ws: Option<WsServerTransport>,
    mqtt: Option<MqttServerTransport>,
}

/// Build the broker and start every enabled transport.
pub async fn start(cfg: BrokerdConfig) -> Result<Daemon, Box<dyn std::error::Error>> {
    let broker = match &cfg.persistence_path {
        Some(path) => Broker::with_store(cfg.broker.clone(), Arc::new(JsonFileStore::new(path))),
        None => Broker::new(cfg.broker.clone()),
    };
    broker.start().await;

    let transport_cfg = TransportConfig::default();

    let tcp = match &cfg.transports.tcp_bind {
        Some(bind) => {
            let server = TcpServerTransport::new(bind.clone(), transport_cfg.clone())?;
            let addr = server.start(broker.clone()).await?;
            info!(addr = %addr, "tcp listening");
            Some(server)
        }
        None => None,
    };

    let ws = match &cfg.transports.ws_bind {
        Some(bind) => {
            let server = WsServerTransport::new(bind.clone(), transport_cfg.clone())?;
            let addr = server.start(broker.clone()).await?;
            info!(addr = %addr, "websocket listening");
            Some(server)
        }
        None => None,
    };

    let mqtt = match &cfg.transports.mqtt {
        Some(mqtt_cfg) => {
            let server = MqttServerTransport::new(mqtt_cfg.clone(), transport_cfg.clone())?;
            server.start(broker.clone()).await?;
            info!(host = %mqtt_cfg.broker_host, "mqtt bridging");
            Some(server)
        }
        None => None,
    };

    if cfg.transports.stdio {
        skybus_transport::stdio::attach_stdio(&broker, &transport_cfg).await;
        info!("stdio peer attached");
    }

    Ok(Daemon {
        broker,
        tcp,
        ws,
        mqtt,
    })
}

impl Daemon {
    /// Stop transports first (no new peers), then the broker (drain and
    /// close existing sessions).
    pub async fn shutdown(self) {
        if let Some(tcp) = &self.tcp {
            tcp.stop().await;
        }
        if let Some(ws) = &self.ws {
            ws.stop().await;
        }
        if let Some(mqtt) = &self.mqtt {
            mqtt.stop().await;
        }
        self.broker.stop().await;
    }
}
