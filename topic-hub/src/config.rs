use std::time::Duration;

use crate::{cli::ServeArgs, frame::MAX_TEXT_PAYLOAD, keepalive::PongReply};

/// Runtime settings for a [`crate::hub::Hub`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Text frames whose declared length exceeds this are skipped unread.
    pub max_text_payload: usize,
    /// Per-connection data lane capacity; a full lane drops fan-out to that peer.
    pub outbound_capacity: usize,
    /// How long shutdown waits for sessions before abandoning them.
    pub grace_period: Duration,
    pub pong_reply: PongReply,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_text_payload: MAX_TEXT_PAYLOAD,
            outbound_capacity: 256,
            grace_period: Duration::from_secs(5),
            pong_reply: PongReply::Echo,
        }
    }
}

impl From<&ServeArgs> for HubConfig {
    fn from(args: &ServeArgs) -> Self {
        let pong_reply = match &args.pong_reply {
            Some(reply) => PongReply::Fixed(reply.clone().into_bytes()),
            None => PongReply::Echo,
        };

        Self {
            max_text_payload: args.max_text_payload,
            outbound_capacity: args.outbound_capacity,
            grace_period: Duration::from_secs(args.grace_period_secs),
            pong_reply,
        }
    }
}
