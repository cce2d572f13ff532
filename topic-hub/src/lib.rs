//! Topic-based publish/subscribe hub over WebSockets.
//!
//! Clients attach to a topic by upgrading `GET /{topic}`; every text frame a
//! client sends is fanned out to every other client on the same topic. Each
//! module focuses on a concrete responsibility:
//!
//! - [`registry`] keeps topic membership behind a single lock and hands out
//!   snapshots for iteration.
//! - [`connection`] is the shared handle to one socket: two outbound lanes
//!   (control before data) and an idempotent close.
//! - [`session`] runs the per-connection read loop and dispatches frames.
//! - [`broadcast`] fans a payload out over a snapshot, isolating failures.
//! - [`keepalive`] answers pings.
//! - [`shutdown`] stops admissions and drains every connection on SIGTERM or
//!   SIGINT.
//! - [`server`] is the axum admission layer; [`client`] a terminal client.
//! - [`cli`] and [`config`] parse flags into a [`config::HubConfig`].
//!
//! Sessions never see the wire format: [`wire`] decodes each socket into
//! [`frame::Frame`]s, checking a text frame's announced length before its
//! body is read.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod hub;
pub mod keepalive;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod wire;
