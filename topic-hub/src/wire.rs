//! WebSocket framing (RFC 6455) over an upgraded connection.
//!
//! Frames are read header first. A text message whose announced length is
//! over the ceiling, and every binary message, is skipped on the socket and
//! handed on as an empty [`Frame`] that only carries its declared length, so
//! an oversized payload is never buffered and the connection stays usable.
//! Fragmented messages are reassembled; control frames arriving between
//! fragments are returned as they come.
//!
//! Nothing here answers pings. Pongs only come from the keepalive responder.

use std::io;

use futures::{sink, stream, Sink, Stream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    connection::Outbound,
    error::TransportError,
    frame::{Frame, FrameKind},
};

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

const FIN: u8 = 0x80;
const RESERVED: u8 = 0x70;
const MASKED: u8 = 0x80;
const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy)]
struct Header {
    fin: bool,
    opcode: u8,
    len: u64,
    mask: [u8; 4],
}

/// A data message still waiting for its final fragment.
struct Partial {
    kind: FrameKind,
    payload: Vec<u8>,
    declared_len: u64,
    skipping: bool,
}

pub struct FrameReader<R> {
    inner: R,
    max_text_payload: usize,
    partial: Option<Partial>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, max_text_payload: usize) -> Self {
        Self {
            inner,
            max_text_payload,
            partial: None,
        }
    }

    /// Reads the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closes the stream between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            let Some(header) = self.read_header().await? else {
                return Ok(None);
            };

            match header.opcode {
                OP_CLOSE | OP_PING | OP_PONG => return self.read_control(header).await.map(Some),
                OP_TEXT | OP_BINARY => {
                    if self.partial.is_some() {
                        return Err(protocol("data frame inside a fragmented message"));
                    }
                    let kind = if header.opcode == OP_TEXT {
                        FrameKind::Text
                    } else {
                        FrameKind::Other
                    };
                    let partial = Partial {
                        kind,
                        payload: Vec::new(),
                        declared_len: 0,
                        skipping: false,
                    };
                    if let Some(frame) = self.read_data(partial, header).await? {
                        return Ok(Some(frame));
                    }
                }
                OP_CONTINUATION => {
                    let partial = self
                        .partial
                        .take()
                        .ok_or_else(|| protocol("continuation without a message"))?;
                    if let Some(frame) = self.read_data(partial, header).await? {
                        return Ok(Some(frame));
                    }
                }
                other => return Err(protocol(format!("unknown opcode {other:#x}"))),
            }
        }
    }

    /// Turns the reader into the frame stream a session consumes.
    ///
    /// The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame, TransportError>> + Unpin {
        Box::pin(stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.read_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(reader))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        }))
    }

    async fn read_header(&mut self) -> Result<Option<Header>, TransportError> {
        let first = match self.inner.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(TransportError::socket(err)),
        };
        let second = self.inner.read_u8().await.map_err(TransportError::socket)?;

        if first & RESERVED != 0 {
            return Err(protocol("reserved bits set"));
        }
        if second & MASKED == 0 {
            return Err(protocol("client frame is not masked"));
        }

        let len = match second & 0x7F {
            126 => u64::from(self.inner.read_u16().await.map_err(TransportError::socket)?),
            127 => self.inner.read_u64().await.map_err(TransportError::socket)?,
            short => u64::from(short),
        };

        let mut mask = [0u8; 4];
        self.inner
            .read_exact(&mut mask)
            .await
            .map_err(TransportError::socket)?;

        Ok(Some(Header {
            fin: first & FIN != 0,
            opcode: first & 0x0F,
            len,
            mask,
        }))
    }

    async fn read_control(&mut self, header: Header) -> Result<Frame, TransportError> {
        if !header.fin {
            return Err(protocol("fragmented control frame"));
        }
        if header.len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(protocol(format!("control frame of {} bytes", header.len)));
        }

        let payload = self.read_payload(header).await?;
        let kind = match header.opcode {
            OP_PING => FrameKind::Ping,
            OP_PONG => FrameKind::Pong,
            _ => FrameKind::Close,
        };
        Ok(Frame::new(kind, payload))
    }

    /// Adds one fragment to `partial`; yields the frame once the message is complete.
    async fn read_data(
        &mut self,
        mut partial: Partial,
        header: Header,
    ) -> Result<Option<Frame>, TransportError> {
        partial.declared_len = partial.declared_len.saturating_add(header.len);

        // Binary is never routed, so it is never buffered either.
        let limit = match partial.kind {
            FrameKind::Text => self.max_text_payload as u64,
            _ => 0,
        };

        if partial.skipping || partial.declared_len > limit {
            partial.skipping = true;
            partial.payload = Vec::new();
            self.skip(header.len).await?;
        } else {
            let mut fragment = self.read_payload(header).await?;
            partial.payload.append(&mut fragment);
        }

        if !header.fin {
            self.partial = Some(partial);
            return Ok(None);
        }

        let declared_len = usize::try_from(partial.declared_len).unwrap_or(usize::MAX);
        Ok(Some(Frame::with_declared_len(
            partial.kind,
            partial.payload,
            declared_len,
        )))
    }

    async fn read_payload(&mut self, header: Header) -> Result<Vec<u8>, TransportError> {
        let len = usize::try_from(header.len)
            .map_err(|_| protocol(format!("frame of {} bytes", header.len)))?;
        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(TransportError::socket)?;

        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= header.mask[i % 4];
        }
        Ok(payload)
    }

    async fn skip(&mut self, len: u64) -> Result<(), TransportError> {
        let skipped = tokio::io::copy(&mut (&mut self.inner).take(len), &mut tokio::io::sink())
            .await
            .map_err(TransportError::socket)?;
        if skipped < len {
            return Err(TransportError::socket("connection closed mid-frame"));
        }
        Ok(())
    }
}

/// Serializes an outbound frame. Server frames are never masked.
pub fn encode(frame: &Outbound) -> Vec<u8> {
    let (opcode, payload): (u8, &[u8]) = match frame {
        Outbound::Text(text) => (OP_TEXT, text.as_bytes()),
        Outbound::Pong(payload) => (OP_PONG, &payload[..payload.len().min(MAX_CONTROL_PAYLOAD)]),
        Outbound::Close => (OP_CLOSE, &[]),
    };

    let mut encoded = Vec::with_capacity(payload.len() + 10);
    encoded.push(FIN | opcode);
    match payload.len() {
        len if len < 126 => encoded.push(len as u8),
        len if len <= usize::from(u16::MAX) => {
            encoded.push(126);
            encoded.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            encoded.push(127);
            encoded.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    encoded.extend_from_slice(payload);
    encoded
}

/// Sink that writes and flushes each outbound frame.
pub fn frame_sink<W>(writer: W) -> impl Sink<Outbound, Error = io::Error> + Unpin
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    Box::pin(sink::unfold(writer, |mut writer, frame: Outbound| async move {
        writer.write_all(&encode(&frame)).await?;
        writer.flush().await?;
        Ok::<_, io::Error>(writer)
    }))
}

fn protocol(reason: impl Into<String>) -> TransportError {
    TransportError::Protocol(reason.into())
}
