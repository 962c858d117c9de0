//! In-memory link: the broker sees an ordinary framed peer, the test
//! holds the other end.

use async_trait::async_trait;
use skybus_core::link::{
    FrameSink, FrameSource, IncomingLink, LinkError, LinkMeta, TransportKind,
};
use skybus_protocol::{decode, encode, Envelope, MessageType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct MockSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        Ok(self.rx.recv().await)
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LinkError::Io("mock write failure".to_owned()));
        }
        self.tx
            .send(frame.to_vec())
            .map_err(|_| LinkError::Closed)
    }
}

/// The test-side end of a mock link.
pub struct MockRemote {
    /// Feeds frames into the session's inbound decoder; None once
    /// closed.
    to_broker: Option<mpsc::UnboundedSender<Vec<u8>>>,
    from_broker: mpsc::UnboundedReceiver<Vec<u8>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockRemote {
    /// Feed one envelope to the broker.
    pub fn send(&self, envelope: &Envelope) {
        self.send_frame(encode(envelope));
    }

    /// Feed raw bytes (for malformed-frame tests).
    pub fn send_frame(&self, frame: Vec<u8>) {
        if let Some(tx) = &self.to_broker {
            let _ = tx.send(frame);
        }
    }

    /// Next envelope the broker wrote to this peer, or None once the
    /// session is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let frame = self.from_broker.recv().await?;
        Some(decode(&frame).expect("broker wrote an undecodable frame"))
    }

    /// `recv` with a deadline; None on timeout or close.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.recv()).await.ok()?
    }

    /// Receive, skipping envelopes until one matches `message_type`.
    /// Panics after the deadline.
    pub async fn recv_until(&mut self, message_type: MessageType) -> Envelope {
        let deadline = Duration::from_secs(2);
        loop {
            match self.recv_timeout(deadline).await {
                Some(envelope) if envelope.message_type() == message_type => return envelope,
                Some(_) => continue,
                None => panic!("no {:?} envelope before the deadline", message_type),
            }
        }
    }

    /// Returns true if something is waiting without blocking.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.from_broker
            .try_recv()
            .ok()
            .map(|frame| decode(&frame).expect("broker wrote an undecodable frame"))
    }

    /// Make subsequent broker writes to this peer fail (a paused or
    /// broken writer).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Close the inbound side: the broker sees a clean disconnect.
    pub fn close(&mut self) {
        self.to_broker = None;
    }
}

/// Build a mock link plus its remote controller.
pub fn mock_link() -> (IncomingLink, MockRemote) {
    let (to_broker_tx, to_broker_rx) = mpsc::unbounded_channel();
    let (from_broker_tx, from_broker_rx) = mpsc::unbounded_channel();
    let fail_writes = Arc::new(AtomicBool::new(false));

    let link = IncomingLink {
        meta: LinkMeta::new(TransportKind::Tcp).with_remote("mock"),
        source: Box::new(MockSource { rx: to_broker_rx }),
        sink: Box::new(MockSink {
            tx: from_broker_tx,
            fail_writes: fail_writes.clone(),
        }),
    };
    let remote = MockRemote {
        to_broker: Some(to_broker_tx),
        from_broker: from_broker_rx,
        fail_writes,
    };
    (link, remote)
}
