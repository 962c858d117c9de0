//! The uniform peer interface every transport adaptor presents.
//!
//! An adaptor turns its native connection into a pair of framed halves:
//! a [`FrameSource`] the session's inbound decoder reads from, and a
//! [`FrameSink`] its outbound writer writes to.  Framing (newline
//! delimiters, length prefixes, WebSocket text frames, MQTT topics) is
//! entirely the adaptor's concern; the core only ever sees whole frames.

use async_trait::async_trait;
use skybus_protocol::AuthMethod;

// ---------------------------------------------------------------------------
// Transport tags and per-link metadata
// ---------------------------------------------------------------------------

/// Which adaptor produced a link.  Carried on sessions and registry
/// records for logging and bridge routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    Tcp,
    WebSocket,
    Mqtt,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Tcp => "tcp",
            TransportKind::WebSocket => "websocket",
            TransportKind::Mqtt => "mqtt",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials an adaptor captured during its native connect handshake
/// (e.g. a WebSocket `Authorization: Bearer` header), letting the peer
/// skip the Authentication envelope.
#[derive(Debug, Clone)]
pub struct HandshakeCredentials {
    pub method: AuthMethod,
    pub credentials: String,
}

/// Metadata describing one accepted link.
#[derive(Debug, Clone)]
pub struct LinkMeta {
    pub kind: TransportKind,
    /// Remote address or endpoint description, when the transport has one.
    /// Used as the peer hint for authentication rate limiting.
    pub remote: Option<String>,
    pub handshake_credentials: Option<HandshakeCredentials>,
}

impl LinkMeta {
    pub fn new(kind: TransportKind) -> Self {
        LinkMeta {
            kind,
            remote: None,
            handshake_credentials: None,
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    pub fn with_credentials(mut self, method: AuthMethod, credentials: impl Into<String>) -> Self {
        self.handshake_credentials = Some(HandshakeCredentials {
            method,
            credentials: credentials.into(),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure modes of a framed link.
///
/// `Closed` is fatal to the session; the writer treats `Io`/`Timeout` as
/// a failed attempt and lets the queue's QoS rules decide whether the
/// frame is retried.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("I/O: {0}")]
    Io(String),
    #[error("timed out")]
    Timeout,
    #[error("frame of {0} bytes exceeds the configured maximum")]
    FrameTooLarge(usize),
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(&'static str),
}

impl LinkError {
    /// True when the link cannot carry further traffic.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Closed)
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => LinkError::Closed,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => LinkError::Timeout,
            _ => LinkError::Io(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Framed halves
// ---------------------------------------------------------------------------

/// Inbound half: yields whole frames in wire order.  `Ok(None)` means the
/// peer closed cleanly.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError>;
}

/// Outbound half: writes one whole frame per call.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Flush and close the underlying connection.  Best effort.
    async fn close(&mut self) {}
}

pub type BoxedSource = Box<dyn FrameSource>;
pub type BoxedSink = Box<dyn FrameSink>;

/// One accepted peer, as handed from an adaptor to the broker.
pub struct IncomingLink {
    pub meta: LinkMeta,
    pub source: BoxedSource,
    pub sink: BoxedSink,
}
