//! Error types for the hub.
//!
//! Every variant is scoped to a single connection or a single frame. Nothing
//! here is ever propagated from one session into another.

use std::fmt::Display;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Read or write failure on one connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection was closed and no longer accepts frames.
    #[error("connection closed")]
    Closed,

    /// The connection's outbound queue is full; the peer is not keeping up.
    #[error("outbound queue full")]
    Backpressure,

    /// The underlying socket failed.
    #[error("socket error: {0}")]
    Socket(String),

    /// The peer broke WebSocket framing rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The session loop panicked and was stopped at its error boundary.
    #[error("session panicked: {0}")]
    Panicked(String),
}

impl TransportError {
    pub fn socket(err: impl Display) -> Self {
        Self::Socket(err.to_string())
    }
}

/// Failures the hub logs and isolates.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("too large payload: {len} bytes (limit {limit})")]
    OversizedPayload { len: usize, limit: usize },

    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("failed to deliver to {conn_id}: {source}")]
    Publish {
        conn_id: ConnectionId,
        #[source]
        source: TransportError,
    },

    #[error("failed to close {conn_id} during shutdown: {source}")]
    ShutdownClose {
        conn_id: ConnectionId,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
