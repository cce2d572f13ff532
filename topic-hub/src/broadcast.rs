//! Fan-out of published text to the other members of a topic.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{connection::ConnectionId, error::HubError, registry::Registry};

/// Outcome of one [`Broadcaster::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Queues `payload` on every member of `topic` except `publisher`.
    ///
    /// Iterates a snapshot, so members joining or leaving meanwhile do not
    /// affect this call. A member whose send fails is logged and skipped; it
    /// is neither retried nor closed here, its own session deals with it.
    pub fn publish(&self, topic: &str, payload: Arc<str>, publisher: ConnectionId) -> PublishReport {
        let members = self.registry.snapshot(topic);
        let mut report = PublishReport::default();

        if members.is_empty() {
            debug!(topic, "no members for topic");
            return report;
        }

        debug!(topic, members = members.len(), bytes = payload.len(), "publishing");

        for member in members.iter().filter(|member| member.id() != publisher) {
            match member.send(Arc::clone(&payload)) {
                Ok(()) => report.delivered += 1,
                Err(source) => {
                    report.failed += 1;
                    let err = HubError::Publish {
                        conn_id: member.id(),
                        source,
                    };
                    warn!(topic, publisher = %publisher, error = %err, "delivery failed");
                }
            }
        }

        report
    }
}
