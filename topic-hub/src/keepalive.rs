//! Answers pings with pongs.

use tracing::debug;

use crate::{connection::Connection, error::TransportError};

/// What a pong carries back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PongReply {
    /// Echo the ping payload.
    #[default]
    Echo,
    /// Always answer with the same bytes.
    Fixed(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct KeepaliveResponder {
    reply: PongReply,
}

impl KeepaliveResponder {
    pub fn new(reply: PongReply) -> Self {
        Self { reply }
    }

    /// Queues a pong on the connection's control lane.
    ///
    /// An error here is a transport error for the calling session.
    pub fn on_ping(&self, conn: &Connection, payload: Vec<u8>) -> Result<(), TransportError> {
        debug!(conn_id = %conn.id(), ping = %String::from_utf8_lossy(&payload), "ping");
        let pong = match &self.reply {
            PongReply::Echo => payload,
            PongReply::Fixed(bytes) => bytes.clone(),
        };
        conn.send_pong(pong)
    }
}
