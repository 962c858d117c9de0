//! Byte-stream framing: terminator-delimited and length-prefixed modes
//! over any `AsyncRead`/`AsyncWrite` pair.
//!
//! The reader keeps a rolling buffer so a read timeout never corrupts a
//! partially received frame; the next `recv` picks up where the stream
//! left off.

use crate::{FramingMode, TransportConfig};
use async_trait::async_trait;
use skybus_core::link::{FrameSink, FrameSource, LinkError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Framed inbound half over a raw byte stream.
pub struct FramedReader<R> {
    reader: R,
    framing: FramingMode,
    buffer_size: usize,
    max_frame: usize,
    read_timeout: std::time::Duration,
    pending: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    pub fn new(reader: R, cfg: &TransportConfig) -> Self {
        FramedReader {
            reader,
            framing: cfg.framing,
            buffer_size: cfg.buffer_size,
            max_frame: cfg.max_message_size,
            read_timeout: cfg.read_timeout,
            pending: Vec::new(),
            eof: false,
        }
    }

    /// Pull one chunk off the stream into the rolling buffer.
    /// Returns the number of bytes read (0 at EOF).
    async fn fill(&mut self) -> Result<usize, LinkError> {
        let mut chunk = vec![0u8; self.buffer_size];
        let n = tokio::time::timeout(self.read_timeout, self.reader.read(&mut chunk))
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(LinkError::from)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.pending.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }

    fn take_delimited(&mut self, terminator: u8) -> Result<Option<Vec<u8>>, LinkError> {
        let Some(pos) = self.pending.iter().position(|b| *b == terminator) else {
            if self.pending.len() > self.max_frame {
                return Err(LinkError::FrameTooLarge(self.pending.len()));
            }
            return Ok(None);
        };
        let mut frame: Vec<u8> = self.pending.drain(..=pos).collect();
        frame.pop();
        // Tolerate CRLF when the terminator is a bare newline.
        if terminator == b'\n' && frame.last() == Some(&b'\r') {
            frame.pop();
        }
        if frame.len() > self.max_frame {
            return Err(LinkError::FrameTooLarge(frame.len()));
        }
        Ok(Some(frame))
    }

    fn take_length_prefixed(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        if self.pending.len() < 4 {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.pending[0], self.pending[1], self.pending[2], self.pending[3]])
                as usize;
        if len > self.max_frame {
            return Err(LinkError::FrameTooLarge(len));
        }
        if self.pending.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.pending[4..4 + len].to_vec();
        self.pending.drain(..4 + len);
        Ok(Some(frame))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for FramedReader<R> {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        loop {
            let complete = match self.framing {
                FramingMode::Delimited { terminator } => self.take_delimited(terminator)?,
                FramingMode::LengthPrefixed => self.take_length_prefixed()?,
            };
            if let Some(frame) = complete {
                // Skip blank frames (keep-alive newlines).
                if frame.is_empty() {
                    continue;
                }
                return Ok(Some(frame));
            }
            if self.eof {
                // A trailing partial frame is discarded with the stream.
                return Ok(None);
            }
            self.fill().await?;
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Framed outbound half over a raw byte stream.
pub struct FramedWriter<W> {
    writer: W,
    framing: FramingMode,
    write_timeout: std::time::Duration,
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    pub fn new(writer: W, cfg: &TransportConfig) -> Self {
        FramedWriter {
            writer,
            framing: cfg.framing,
            write_timeout: cfg.write_timeout,
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        match self.framing {
            FramingMode::Delimited { terminator } => {
                self.writer.write_all(frame).await?;
                self.writer.write_all(&[terminator]).await?;
            }
            FramingMode::LengthPrefixed => {
                let len = u32::try_from(frame.len())
                    .map_err(|_| LinkError::FrameTooLarge(frame.len()))?;
                self.writer.write_all(&len.to_be_bytes()).await?;
                self.writer.write_all(frame).await?;
            }
        }
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for FramedWriter<W> {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        tokio::time::timeout(self.write_timeout, self.write_frame(frame))
            .await
            .map_err(|_| LinkError::Timeout)?
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
