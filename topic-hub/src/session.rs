//! Per-connection control loop.
//!
//! A session attaches its connection to a topic, then reads one decoded
//! frame at a time and dispatches it. Whatever ends the loop (close frame,
//! end of stream, read error, a close from another task, or a panic caught at
//! the boundary in [`Session::run`]) the session deregisters exactly once and
//! closes its connection.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionId},
    error::{HubError, TransportError},
    frame::{Frame, FrameKind},
    hub::Hub,
    shutdown::SessionGuard,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Attaching,
    Active,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The peer sent a close frame.
    PeerClosed,
    /// The frame stream ended.
    Disconnected,
    /// The connection was closed by another task (shutdown, failed write).
    Closed,
    /// Shutdown had already begun when the session tried to attach.
    Refused,
    Failed(TransportError),
}

pub struct Session {
    hub: Arc<Hub>,
    topic: String,
    conn: Arc<Connection>,
    state: SessionState,
    deregistered: bool,
    _guard: SessionGuard,
}

impl Session {
    pub fn new(hub: Arc<Hub>, topic: impl Into<String>, conn: Arc<Connection>) -> Self {
        let guard = hub.coordinator().track_session();
        Self {
            hub,
            topic: topic.into(),
            conn,
            state: SessionState::Attaching,
            deregistered: false,
            _guard: guard,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the session to completion over `frames`.
    pub async fn run<S>(mut self, frames: S) -> SessionOutcome
    where
        S: Stream<Item = Result<Frame, TransportError>> + Unpin,
    {
        if !self.attach() {
            self.teardown();
            return SessionOutcome::Refused;
        }

        let result = AssertUnwindSafe(self.read_loop(frames))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                debug!(conn_id = %self.conn.id(), error = %err, "read failed");
                SessionOutcome::Failed(err)
            }
            Err(panic) => {
                let err = TransportError::Panicked(panic_message(panic.as_ref()));
                warn!(conn_id = %self.conn.id(), error = %err, "session loop panicked");
                SessionOutcome::Failed(err)
            }
        };

        self.teardown();
        outcome
    }

    fn attach(&mut self) -> bool {
        self.hub
            .registry()
            .join(&self.topic, Arc::clone(&self.conn));

        // Checked after joining so a concurrent drain either sees this
        // member or this session sees the drain.
        if !self.hub.coordinator().is_accepting() {
            debug!(conn_id = %self.conn.id(), topic = %self.topic, "refused during shutdown");
            return false;
        }

        self.transition(SessionState::Active);
        info!(conn_id = %self.conn.id(), topic = %self.topic, "client attached");
        true
    }

    async fn read_loop<S>(&mut self, mut frames: S) -> Result<SessionOutcome, TransportError>
    where
        S: Stream<Item = Result<Frame, TransportError>> + Unpin,
    {
        let conn = Arc::clone(&self.conn);

        loop {
            let next = tokio::select! {
                biased;
                _ = conn.closed() => return Ok(SessionOutcome::Closed),
                next = frames.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(err),
                None => return Ok(SessionOutcome::Disconnected),
            };

            match frame.kind() {
                FrameKind::Ping => {
                    self.hub.responder().on_ping(&conn, frame.into_payload())?;
                }
                FrameKind::Text => self.handle_text(frame),
                FrameKind::Close => return Ok(SessionOutcome::PeerClosed),
                FrameKind::Pong | FrameKind::Other => {
                    debug!(conn_id = %conn.id(), kind = ?frame.kind(), "discarding frame");
                    frame.discard();
                }
            }
        }
    }

    fn handle_text(&self, frame: Frame) {
        let limit = self.hub.config().max_text_payload;
        if frame.exceeds(limit) {
            let err = HubError::OversizedPayload {
                len: frame.declared_len(),
                limit,
            };
            warn!(conn_id = %self.conn.id(), topic = %self.topic, error = %err, "rejected text frame");
            frame.discard();
            return;
        }

        let text = match String::from_utf8(frame.into_payload()) {
            Ok(text) => text,
            Err(_) => {
                warn!(conn_id = %self.conn.id(), error = %HubError::InvalidUtf8, "rejected text frame");
                return;
            }
        };

        let report = self
            .hub
            .broadcaster()
            .publish(&self.topic, Arc::from(text), self.conn.id());
        debug!(
            conn_id = %self.conn.id(),
            topic = %self.topic,
            delivered = report.delivered,
            failed = report.failed,
            "published"
        );
    }

    fn teardown(&mut self) {
        self.transition(SessionState::Closing);
        self.deregister();
        if let Err(err) = self.conn.close() {
            debug!(conn_id = %self.conn.id(), error = %err, "writer already gone");
        }
        self.transition(SessionState::Closed);
    }

    fn deregister(&mut self) {
        if std::mem::replace(&mut self.deregistered, true) {
            return;
        }

        let removed = self.hub.registry().leave(&self.topic, self.conn.id());
        info!(conn_id = %self.conn.id(), topic = %self.topic, removed, "client detached");
    }

    fn transition(&mut self, next: SessionState) {
        debug!(conn_id = %self.conn.id(), from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
