//! Duplex connection handling for MRD streaming sessions
//!
//! A connection is split into two single-owner halves: an inbound reader that
//! yields decoded messages one at a time (single pass, never restartable) and
//! an outbound writer exposing one send operation per message kind. Each half
//! has exactly one execution context, so frames from a role never interleave.

use async_trait::async_trait;
use futures::stream::Stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::codec;
use crate::error::Result;
use crate::types::{Acquisition, Image, LogLevel, StreamMessage, Waveform};

/// Inbound role of a connection: a single-pass sequence of decoded messages
///
/// The sequence ends at a decoded `Close`, at physical end-of-stream, or at
/// the first protocol error; the error is surfaced to the caller rather than
/// silently truncating the stream.
#[async_trait]
pub trait InboundChannel: Send {
    /// Read the next message; `Ok(None)` signals physical end-of-stream
    async fn next_message(&mut self) -> Result<Option<StreamMessage>>;
}

/// Outbound role of a connection: one send operation per message kind
///
/// Every call fully writes one frame before returning.
#[async_trait]
pub trait OutboundChannel: Send {
    async fn send_config_name(&mut self, name: &str) -> Result<()>;
    async fn send_config_text(&mut self, text: &str) -> Result<()>;
    async fn send_metadata(&mut self, metadata: &str) -> Result<()>;
    async fn send_text(&mut self, text: &str) -> Result<()>;
    async fn send_logging(&mut self, level: LogLevel, text: &str) -> Result<()>;
    async fn send_acquisition(&mut self, acquisition: &Acquisition) -> Result<()>;
    async fn send_image(&mut self, image: &Image) -> Result<()>;
    async fn send_waveform(&mut self, waveform: &Waveform) -> Result<()>;
    async fn send_close(&mut self) -> Result<()>;
}

/// Per-kind record counters for one connection half
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub acquisitions: u64,
    pub images: u64,
    pub waveforms: u64,
}

/// Reader half of a duplex MRD connection
pub struct ConnectionReader<R> {
    reader: R,
    received: RecordCounts,
}

impl<R> ConnectionReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            received: RecordCounts::default(),
        }
    }

    /// Records decoded so far, by kind
    pub fn received(&self) -> RecordCounts {
        self.received
    }

    /// Consume the reader into a message stream ending at Close or error
    pub fn into_stream(mut self) -> impl Stream<Item = Result<StreamMessage>> {
        async_stream::stream! {
            loop {
                match self.next_message().await {
                    Ok(Some(message)) => {
                        let done = message == StreamMessage::Close;
                        yield Ok(message);
                        if done {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<R> InboundChannel for ConnectionReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_message(&mut self) -> Result<Option<StreamMessage>> {
        let message = codec::read_message(&mut self.reader).await?;
        if let Some(ref message) = message {
            trace!("Received {} frame", message.kind_name());
            match message {
                StreamMessage::Acquisition(_) => self.received.acquisitions += 1,
                StreamMessage::Image(_) => self.received.images += 1,
                StreamMessage::Waveform(_) => self.received.waveforms += 1,
                _ => {}
            }
        }
        Ok(message)
    }
}

/// Writer half of a duplex MRD connection
pub struct ConnectionWriter<W> {
    writer: W,
    sent: RecordCounts,
}

impl<W> ConnectionWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            sent: RecordCounts::default(),
        }
    }

    /// Records written so far, by kind
    pub fn sent(&self) -> RecordCounts {
        self.sent
    }

    async fn send(&mut self, message: &StreamMessage) -> Result<()> {
        trace!("Sending {} frame", message.kind_name());
        codec::write_message(&mut self.writer, message).await
    }
}

#[async_trait]
impl<W> OutboundChannel for ConnectionWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_config_name(&mut self, name: &str) -> Result<()> {
        self.send(&StreamMessage::ConfigName(name.to_string())).await
    }

    async fn send_config_text(&mut self, text: &str) -> Result<()> {
        self.send(&StreamMessage::ConfigText(text.to_string())).await
    }

    async fn send_metadata(&mut self, metadata: &str) -> Result<()> {
        self.send(&StreamMessage::Metadata(metadata.to_string())).await
    }

    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(&StreamMessage::Text(text.to_string())).await
    }

    async fn send_logging(&mut self, level: LogLevel, text: &str) -> Result<()> {
        self.send(&StreamMessage::Logging(level, text.to_string()))
            .await
    }

    async fn send_acquisition(&mut self, acquisition: &Acquisition) -> Result<()> {
        self.send(&StreamMessage::Acquisition(acquisition.clone()))
            .await?;
        self.sent.acquisitions += 1;
        Ok(())
    }

    async fn send_image(&mut self, image: &Image) -> Result<()> {
        self.send(&StreamMessage::Image(image.clone())).await?;
        self.sent.images += 1;
        Ok(())
    }

    async fn send_waveform(&mut self, waveform: &Waveform) -> Result<()> {
        self.send(&StreamMessage::Waveform(waveform.clone())).await?;
        self.sent.waveforms += 1;
        Ok(())
    }

    async fn send_close(&mut self) -> Result<()> {
        self.send(&StreamMessage::Close).await
    }
}

/// A duplex MRD connection over a TCP socket
pub struct Connection;

impl Connection {
    /// Split a socket into its reader and writer halves
    ///
    /// Each half must stay on its own task; the reader half is the only
    /// context allowed to mirror consumed records into a dataset.
    pub fn split(
        stream: TcpStream,
    ) -> (
        ConnectionReader<OwnedReadHalf>,
        ConnectionWriter<OwnedWriteHalf>,
    ) {
        if let Ok(peer) = stream.peer_addr() {
            debug!("Splitting connection with {}", peer);
        }
        let (read_half, write_half) = stream.into_split();
        (
            ConnectionReader::new(read_half),
            ConnectionWriter::new(write_half),
        )
    }
}
