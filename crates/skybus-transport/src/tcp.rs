//! TCP adaptor: line-framed JSON envelopes over plain sockets.
//!
//! Server role accepts connections and attaches each as a peer session;
//! client role connects out (with bounded reconnect attempts) and
//! surfaces one link for the caller to drive.

use crate::framing::{FramedReader, FramedWriter};
use crate::{validate_endpoint, TransportConfig, TransportError};
use skybus_core::link::{IncomingLink, LinkMeta, TransportKind};
use skybus_core::Broker;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpListener, TcpStream,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn split_stream(
    stream: TcpStream,
    cfg: &TransportConfig,
) -> (FramedReader<OwnedReadHalf>, FramedWriter<OwnedWriteHalf>) {
    if cfg.platform_optimizations {
        let _ = stream.set_nodelay(true);
    }
    let (read_half, write_half) = stream.into_split();
    (
        FramedReader::new(read_half, cfg),
        FramedWriter::new(write_half, cfg),
    )
}

// ---------------------------------------------------------------------------
// Server role
// ---------------------------------------------------------------------------

struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Accept loop that attaches every TCP connection to the broker.
pub struct TcpServerTransport {
    bind_addr: String,
    cfg: TransportConfig,
    running: Mutex<Option<ServerHandle>>,
}

impl TcpServerTransport {
    pub fn new(bind_addr: impl Into<String>, cfg: TransportConfig) -> Result<Self, TransportError> {
        let bind_addr = bind_addr.into();
        cfg.validate()?;
        validate_endpoint(&bind_addr)?;
        Ok(TcpServerTransport {
            bind_addr,
            cfg,
            running: Mutex::new(None),
        })
    }

    /// Bind and start accepting.  Idempotent: a second call returns the
    /// existing listen address.
    pub async fn start(&self, broker: Broker) -> Result<SocketAddr, TransportError> {
        let mut running = self.running.lock().await;
        if let Some(handle) = running.as_ref() {
            return Ok(handle.local_addr);
        }

        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(TransportError::Bind)?;
        let local_addr = listener
            .local_addr()
            .expect("local_addr always succeeds after bind");
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let cfg = self.cfg.clone();

        let task = tokio::spawn(async move {
            info!(addr = %local_addr, "tcp transport listening");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            let (reader, writer) = split_stream(stream, &cfg);
                            let meta = LinkMeta::new(TransportKind::Tcp)
                                .with_remote(peer_addr.to_string());
                            broker
                                .attach_link(IncomingLink {
                                    meta,
                                    source: Box::new(reader),
                                    sink: Box::new(writer),
                                })
                                .await;
                        }
                        Err(e) => {
                            warn!(error = %e, "tcp accept failed");
                            break;
                        }
                    }
                }
            }
        });

        *running = Some(ServerHandle {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop accepting.  Idempotent; existing sessions are left to the
    /// broker's own lifecycle.
    pub async fn stop(&self) {
        if let Some(handle) = self.running.lock().await.take() {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
            info!(addr = %handle.local_addr, "tcp transport stopped");
        }
    }

    /// The bound address once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|h| h.local_addr)
    }
}

// ---------------------------------------------------------------------------
// Client role
// ---------------------------------------------------------------------------

/// Reconnect policy for the client role.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            interval: Duration::from_secs(2),
            max_attempts: 5,
        }
    }
}

/// Connect to a remote broker endpoint, retrying per the policy, and
/// surface the resulting link.
pub async fn connect_tcp(
    endpoint: &str,
    cfg: &TransportConfig,
    policy: &ReconnectPolicy,
) -> Result<IncomingLink, TransportError> {
    cfg.validate()?;
    validate_endpoint(endpoint)?;

    let mut last_error = String::new();
    for attempt in 0..policy.max_attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(policy.interval).await;
        }
        match TcpStream::connect(endpoint).await {
            Ok(stream) => {
                let remote = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| endpoint.to_owned());
                let (reader, writer) = split_stream(stream, cfg);
                return Ok(IncomingLink {
                    meta: LinkMeta::new(TransportKind::Tcp).with_remote(remote),
                    source: Box::new(reader),
                    sink: Box::new(writer),
                });
            }
            Err(e) => {
                warn!(endpoint, attempt, error = %e, "tcp connect failed");
                last_error = e.to_string();
            }
        }
    }
    Err(TransportError::Connect(format!(
        "{} after {} attempts: {}",
        endpoint, policy.max_attempts, last_error
    )))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
