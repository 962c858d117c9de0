//! WebSocket adaptor: one envelope per text frame.
//!
//! Binary frames are rejected — the wire contract is JSON text.  A
//! `Authorization: Bearer` header presented during the HTTP upgrade is
//! captured and surfaced as handshake credentials, so WS peers are
//! authenticated before their first envelope.

use crate::{validate_endpoint, TransportConfig, TransportError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use skybus_core::link::{
    FrameSink, FrameSource, IncomingLink, LinkError, LinkMeta, TransportKind,
};
use skybus_core::Broker;
use skybus_protocol::AuthMethod;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Framed halves over a WebSocket
// ---------------------------------------------------------------------------

pub struct WsFrameSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
    max_frame: usize,
}

#[async_trait]
impl<S> FrameSource for WsFrameSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(map_ws_error(e)),
                Some(Ok(Message::Text(text))) => {
                    if text.len() > self.max_frame {
                        return Err(LinkError::FrameTooLarge(text.len()));
                    }
                    return Ok(Some(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Binary(_))) => {
                    return Err(LinkError::UnsupportedFrame("binary WebSocket frame"));
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Ping/Pong are control traffic; pongs are queued by the
                // protocol layer and flushed with the next write.
                Some(Ok(_)) => continue,
            }
        }
    }
}

pub struct WsFrameSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let text = String::from_utf8(frame.to_vec())
            .map_err(|_| LinkError::UnsupportedFrame("non-UTF-8 payload on a text transport"))?;
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

fn map_ws_error(e: tokio_tungstenite::tungstenite::Error) -> LinkError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::ConnectionClosed | Error::AlreadyClosed => LinkError::Closed,
        Error::Io(io) => LinkError::from(io),
        other => LinkError::Io(other.to_string()),
    }
}

fn split_ws<S>(ws: WebSocketStream<S>, cfg: &TransportConfig) -> (WsFrameSource<S>, WsFrameSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (sink, stream) = ws.split();
    (
        WsFrameSource {
            stream,
            max_frame: cfg.max_message_size,
        },
        WsFrameSink { sink },
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

/// Accept loop that upgrades TCP connections to WebSocket sessions.
pub struct WsServerTransport {
    bind_addr: String,
    cfg: TransportConfig,
    running: Mutex<Option<ServerHandle>>,
}

impl WsServerTransport {
    pub fn new(bind_addr: impl Into<String>, cfg: TransportConfig) -> Result<Self, TransportError> {
        let bind_addr = bind_addr.into();
        cfg.validate()?;
        validate_endpoint(&bind_addr)?;
        Ok(WsServerTransport {
            bind_addr,
            cfg,
            running: Mutex::new(None),
        })
    }

    /// Bind and start accepting.  Idempotent.
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
            info!(addr = %local_addr, "websocket transport listening");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            // Handshakes can stall; never block the
                            // accept loop on one.
                            tokio::spawn(upgrade_and_attach(
                                stream,
                                peer_addr,
                                cfg.clone(),
                                broker.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!(error = %e, "websocket accept failed");
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

    /// Stop accepting.  Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.running.lock().await.take() {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
            info!(addr = %handle.local_addr, "websocket transport stopped");
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|h| h.local_addr)
    }
}

async fn upgrade_and_attach(
    stream: TcpStream,
    peer_addr: SocketAddr,
    cfg: TransportConfig,
    broker: Broker,
) {
    let mut bearer: Option<String> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        bearer = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_owned);
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let (source, sink) = split_ws(ws, &cfg);
    let mut meta = LinkMeta::new(TransportKind::WebSocket).with_remote(peer_addr.to_string());
    if let Some(token) = bearer {
        meta = meta.with_credentials(AuthMethod::Token, token);
    }
    broker
        .attach_link(IncomingLink {
            meta,
            source: Box::new(source),
            sink: Box::new(sink),
        })
        .await;
}

// ---------------------------------------------------------------------------
// Client role
// ---------------------------------------------------------------------------

/// Connect to a `ws://`/`wss://` endpoint, optionally presenting a
/// bearer token, and surface the link.
pub async fn connect_ws(
    url: &str,
    cfg: &TransportConfig,
    token: Option<&str>,
) -> Result<IncomingLink, TransportError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    cfg.validate()?;
    validate_endpoint(url)?;

    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::Connect(format!("invalid URL '{}': {}", url, e)))?;
    if let Some(token) = token {
        let value = format!("Bearer {}", token)
            .parse()
            .map_err(|_| TransportError::Connect("invalid auth header".to_owned()))?;
        request.headers_mut().insert("Authorization", value);
    }

    let (ws, _response) = connect_async(request)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let (source, sink) = split_ws(ws, cfg);

    let mut meta = LinkMeta::new(TransportKind::WebSocket).with_remote(url);
    if let Some(token) = token {
        meta = meta.with_credentials(AuthMethod::Token, token);
    }
    Ok(IncomingLink {
        meta,
        source: Box::new(source),
        sink: Box::new(sink),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
