//! Stdio adaptor: framed envelopes over the process's stdin/stdout.
//!
//! Stdio carries exactly one peer, so the "server" role is attaching
//! that single link to the broker; the client role surfaces the same
//! link for a process that talks to a broker through its own stdio.
//! Reads and writes run on the usual pair of session tasks, which is
//! what keeps blocking stdio out of everyone else's way.

use crate::framing::{FramedReader, FramedWriter};
use crate::TransportConfig;
use skybus_core::link::{IncomingLink, LinkMeta, TransportKind};
use skybus_core::Broker;
use tokio::io::{Stdin, Stdout};

/// Build the process's single stdio link.
pub fn stdio_link(cfg: &TransportConfig) -> IncomingLink {
    let reader: FramedReader<Stdin> = FramedReader::new(tokio::io::stdin(), cfg);
    let writer: FramedWriter<Stdout> = FramedWriter::new(tokio::io::stdout(), cfg);
    IncomingLink {
        meta: LinkMeta::new(TransportKind::Stdio).with_remote("stdio"),
        source: Box::new(reader),
        sink: Box::new(writer),
    }
}

/// Attach the process's stdio as one peer session on the broker.
/// Returns the peer id.
pub async fn attach_stdio(broker: &Broker, cfg: &TransportConfig) -> String {
    broker.attach_link(stdio_link(cfg)).await
}
