//! Cross-protocol relay.
//!
//! A bridge holds two client-role links — usually on different
//! transports — and republishes every envelope received on the source
//! onto the destination.  The transform is identity except for the
//! message id: a fresh one is minted so acks correlate per side and a
//! loop of bridges can never confuse the two legs.
//!
//! Bridges are optional and never constructed unless configured.

use crate::TransportError;
use skybus_core::link::IncomingLink;
use skybus_protocol::{decode, encode, new_message_id, Envelope, MessageType};
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Optional relay filter.  Empty lists mean no restriction.
#[derive(Debug, Clone, Default)]
pub struct BridgeFilter {
    pub message_types: Vec<MessageType>,
    pub device_ids: Vec<String>,
}

impl BridgeFilter {
    fn admits(&self, envelope: &Envelope) -> bool {
        if !self.message_types.is_empty()
            && !self.message_types.contains(&envelope.message_type())
        {
            return false;
        }
        if !self.device_ids.is_empty() {
            let device_id = envelope.device_id.as_deref().unwrap_or_default();
            if !self.device_ids.iter().any(|d| d == device_id) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// One-way relay from `source` to `destination`.
pub struct Bridge {
    source: IncomingLink,
    destination: IncomingLink,
    filter: Option<BridgeFilter>,
}

impl Bridge {
    pub fn new(source: IncomingLink, destination: IncomingLink) -> Self {
        Bridge {
            source,
            destination,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: BridgeFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Relay until the source closes or `shutdown` flips.  Returns the
    /// number of envelopes relayed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<u64, TransportError> {
        info!(
            source = %self.source.meta.kind,
            destination = %self.destination.meta.kind,
            "bridge running"
        );
        let mut relayed: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                frame = self.source.source.recv() => match frame {
                    Ok(Some(bytes)) => {
                        let mut envelope = match decode(&bytes) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                debug!(error = %e, "bridge skipping undecodable frame");
                                continue;
                            }
                        };
                        if let Some(filter) = &self.filter {
                            if !filter.admits(&envelope) {
                                continue;
                            }
                        }
                        // Fresh id per side; payload and target pass
                        // through untouched.
                        envelope.message_id = new_message_id();
                        if let Err(e) = self.destination.sink.send(&encode(&envelope)).await {
                            warn!(error = %e, "bridge destination write failed");
                            if e.is_fatal() {
                                return Err(TransportError::Connect(e.to_string()));
                            }
                        } else {
                            relayed += 1;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if e.is_fatal() {
                            break;
                        }
                        debug!(error = %e, "bridge source error");
                    }
                }
            }
        }
        self.destination.sink.close().await;
        info!(relayed, "bridge finished");
        Ok(relayed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{FramedReader, FramedWriter};
    use crate::TransportConfig;
    use skybus_core::link::{LinkMeta, TransportKind};
    use skybus_protocol::Envelope;

    /// An in-memory link pair: frames written to the returned remote
    /// writer appear on the link's source, and vice versa.
    fn duplex_link() -> (
        IncomingLink,
        FramedWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        FramedReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    ) {
        let cfg = TransportConfig::default();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);
        let link = IncomingLink {
            meta: LinkMeta::new(TransportKind::Tcp),
            source: Box::new(FramedReader::new(local_read, &cfg)),
            sink: Box::new(FramedWriter::new(local_write, &cfg)),
        };
        (
            link,
            FramedWriter::new(remote_write, &cfg),
            FramedReader::new(remote_read, &cfg),
        )
    }

    #[tokio::test]
    async fn bridge_relays_with_a_fresh_message_id() {
        use skybus_core::link::{FrameSink as _, FrameSource as _};

        let (source_link, mut source_feed, _source_out) = duplex_link();
        let (dest_link, _dest_feed, mut dest_out) = duplex_link();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bridge = tokio::spawn(Bridge::new(source_link, dest_link).run(shutdown_rx));

        let original = Envelope::event("scope-1", "slew_done");
        source_feed.send(&encode(&original)).await.unwrap();

        let relayed = dest_out.recv().await.unwrap().expect("relayed frame");
        let relayed = decode(&relayed).expect("decodable");
        assert_eq!(relayed.device_id.as_deref(), Some("scope-1"));
        assert_eq!(relayed.message_type(), MessageType::Event);
        assert_ne!(relayed.message_id, original.message_id);

        let _ = shutdown_tx.send(true);
        let relayed_count = bridge.await.unwrap().unwrap();
        assert_eq!(relayed_count, 1);
    }

    #[tokio::test]
    async fn filter_drops_unmatched_envelopes() {
        use skybus_core::link::{FrameSink as _, FrameSource as _};

        let (source_link, mut source_feed, _source_out) = duplex_link();
        let (dest_link, _dest_feed, mut dest_out) = duplex_link();

        let filter = BridgeFilter {
            message_types: vec![MessageType::Event],
            device_ids: vec!["scope-1".to_owned()],
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bridge = tokio::spawn(
            Bridge::new(source_link, dest_link)
                .with_filter(filter)
                .run(shutdown_rx),
        );

        // Wrong device, then wrong type, then a match.
        source_feed
            .send(&encode(&Envelope::event("cam-9", "x")))
            .await
            .unwrap();
        source_feed
            .send(&encode(&Envelope::command(
                "scope-1",
                "goto",
                serde_json::Map::new(),
            )))
            .await
            .unwrap();
        source_feed
            .send(&encode(&Envelope::event("scope-1", "slew_done")))
            .await
            .unwrap();

        let relayed = dest_out.recv().await.unwrap().expect("relayed frame");
        let relayed = decode(&relayed).expect("decodable");
        assert_eq!(relayed.message_type(), MessageType::Event);
        assert_eq!(relayed.device_id.as_deref(), Some("scope-1"));

        let _ = shutdown_tx.send(true);
        let relayed_count = bridge.await.unwrap().unwrap();
        assert_eq!(relayed_count, 1);
    }
}
