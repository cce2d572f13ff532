//! Decoded frames as the hub sees them.
//!
//! The wire codec lives outside the hub. Whatever decodes the socket hands the
//! session a [`Frame`] carrying its kind, its payload and the length the
//! frame header announced.

/// Largest text payload the hub will fan out.
pub const MAX_TEXT_PAYLOAD: usize = 19_980_206;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Ping,
    Pong,
    Text,
    Close,
    /// Binary or anything else the hub does not route.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    payload: Vec<u8>,
    declared_len: usize,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        let declared_len = payload.len();
        Self {
            kind,
            payload,
            declared_len,
        }
    }

    /// Builds a frame whose header announced `declared_len` bytes.
    ///
    /// Codecs that read the header before the body use this to hand over an
    /// oversized frame without buffering it; the payload may then be empty.
    pub fn with_declared_len(kind: FrameKind, payload: Vec<u8>, declared_len: usize) -> Self {
        Self {
            kind,
            payload,
            declared_len,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Text, text.into().into_bytes())
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameKind::Ping, payload.into())
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameKind::Pong, payload.into())
    }

    pub fn close() -> Self {
        Self::new(FrameKind::Close, Vec::new())
    }

    pub fn other(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameKind::Other, payload.into())
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn declared_len(&self) -> usize {
        self.declared_len
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn exceeds(&self, limit: usize) -> bool {
        self.declared_len > limit
    }

    /// Drops whatever is left of the frame so the next read starts clean.
    pub fn discard(self) {
        drop(self.payload);
    }
}
