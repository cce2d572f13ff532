//! Connection handles shared by sessions, the broadcaster and shutdown.
//!
//! A [`Connection`] never touches the socket itself. Outbound frames are
//! queued on two lanes that a per-connection writer task drains into the
//! socket:
//!
//! - the **control** lane (pongs, close) is unbounded and always drained
//!   first, so keepalive replies never wait behind broadcast backlog;
//! - the **data** lane (fanned-out text) is bounded, and a full lane fails
//!   the send instead of blocking the publisher.
//!
//! Closing flips a watch flag. The owning session selects on that flag next
//! to its pending read, which is how a close from another task cancels it.

use std::{fmt, sync::Arc};

use futures::{Sink, SinkExt};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tracing::debug;

use crate::error::TransportError;

/// Identity of a connection, issued by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A frame waiting to be written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Pong(Vec<u8>),
    Close,
}

pub struct Connection {
    id: ConnectionId,
    data: mpsc::Sender<Outbound>,
    control: mpsc::UnboundedSender<Outbound>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Creates a handle plus the receiving ends its writer task drains.
    pub fn new(id: ConnectionId, data_capacity: usize) -> (Arc<Self>, OutboundLanes) {
        let (data_tx, data_rx) = mpsc::channel(data_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let conn = Arc::new(Self {
            id,
            data: data_tx,
            control: control_tx,
            closed,
        });
        let lanes = OutboundLanes {
            control: control_rx,
            data: data_rx,
        };

        (conn, lanes)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a text frame without waiting for room.
    pub fn send(&self, payload: Arc<str>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        self.data
            .try_send(Outbound::Text(payload))
            .map_err(|err| match err {
                TrySendError::Full(_) => TransportError::Backpressure,
                TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    /// Queues a pong ahead of any pending text.
    pub fn send_pong(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        self.control
            .send(Outbound::Pong(payload))
            .map_err(|_| TransportError::Closed)
    }

    /// Marks the connection closed and queues a close frame.
    ///
    /// Only the first call does anything; later calls return `Ok(())`. An
    /// error means the writer is already gone, the connection is still
    /// considered closed.
    pub fn close(&self) -> Result<(), TransportError> {
        let first = self
            .closed
            .send_if_modified(|closed| !std::mem::replace(closed, true));
        if !first {
            return Ok(());
        }

        self.control
            .send(Outbound::Close)
            .map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Receiving ends of a connection's outbound lanes.
pub struct OutboundLanes {
    control: mpsc::UnboundedReceiver<Outbound>,
    data: mpsc::Receiver<Outbound>,
}

impl OutboundLanes {
    /// Next frame to write, control lane first.
    pub async fn next(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            Some(frame) = self.control.recv() => Some(frame),
            Some(frame) = self.data.recv() => Some(frame),
            else => None,
        }
    }

    /// Non-blocking variant of [`OutboundLanes::next`].
    pub fn try_next(&mut self) -> Option<Outbound> {
        self.control
            .try_recv()
            .ok()
            .or_else(|| self.data.try_recv().ok())
    }
}

/// Writer task body: drains `lanes` into `sink` until the close frame is out.
///
/// A failed write closes the connection so its session stops reading.
pub async fn write_frames<W>(
    conn: Arc<Connection>,
    mut lanes: OutboundLanes,
    mut sink: W,
) -> Result<(), TransportError>
where
    W: Sink<Outbound> + Unpin,
    W::Error: fmt::Display,
{
    while let Some(frame) = lanes.next().await {
        let is_close = frame == Outbound::Close;
        if let Err(err) = sink.send(frame).await {
            debug!(conn_id = %conn.id(), error = %err, "write failed");
            let _ = conn.close();
            return Err(TransportError::socket(err));
        }
        if is_close {
            break;
        }
    }

    if let Err(err) = sink.close().await {
        debug!(conn_id = %conn.id(), error = %err, "sink close failed");
    }
    Ok(())
}
