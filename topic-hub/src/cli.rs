use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::frame::MAX_TEXT_PAYLOAD;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level used when RUST_LOG is not set (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub, accepting WebSocket upgrades on `/{topic}`.
    Serve(ServeArgs),
    /// Attach to a topic, publish stdin lines and print what others publish.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the hub should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:12345")]
    pub listen: SocketAddr,

    /// Largest text payload, in bytes, that will be fanned out.
    #[arg(long, default_value_t = MAX_TEXT_PAYLOAD)]
    pub max_text_payload: usize,

    /// Frames buffered per subscriber before fan-out to it starts failing.
    #[arg(long, default_value_t = 256)]
    pub outbound_capacity: usize,

    /// Seconds to wait for sessions to finish once shutdown starts.
    #[arg(long, default_value_t = 5)]
    pub grace_period_secs: u64,

    /// Fixed pong payload. Pings are echoed back when unset.
    #[arg(long)]
    pub pong_reply: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Topic to attach to.
    #[arg(long)]
    pub topic: String,

    /// Host and port of the hub.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub server: String,

    /// Seconds between keepalive pings.
    #[arg(long, default_value_t = 3)]
    pub ping_interval_secs: u64,
}
