//! WebSocket admission layer.
//!
//! `GET /{topic}` completes the WebSocket handshake and hands the upgraded
//! connection to a session on that topic. Each socket gets a writer task
//! draining the connection's outbound lanes; the session owns the read half
//! through a [`FrameReader`].

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Request, State},
    http::{
        header::{
            CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
        },
        HeaderMap, HeaderName, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::TcpListener,
    time::timeout,
};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    connection::write_frames,
    hub::Hub,
    shutdown::{termination_signal, DrainReport},
    wire::{frame_sink, FrameReader},
};

pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl Server {
    pub fn new(listener: TcpListener, hub: Arc<Hub>) -> Self {
        Self { listener, hub }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Serves until `shutdown` resolves, then drains the hub.
    pub async fn run_until<F>(self, shutdown: F) -> Result<DrainReport>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, hub } = self;
        let coordinator = Arc::clone(hub.coordinator());
        let app = router(hub);

        let drained = {
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.drained().await }
        };
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(drained)
                .await
        });

        tokio::pin!(shutdown);
        tokio::select! {
            _ = &mut shutdown => {}
            result = &mut server => {
                result.context("server task panicked")?.context("server failed")?;
                return Ok(coordinator.shutdown().await);
            }
        }

        info!("shutting down...");
        let report = coordinator.shutdown().await;

        match timeout(coordinator.grace_period(), server).await {
            Ok(joined) => {
                joined.context("server task panicked")?.context("server failed")?;
                info!("server closed gracefully");
            }
            Err(_) => warn!("server did not stop within the grace period"),
        }

        Ok(report)
    }

    pub async fn run_until_signal(self) -> Result<DrainReport> {
        self.run_until(termination_signal()).await
    }
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/:topic", get(attach))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub topics: usize,
    pub members: usize,
    pub sessions: usize,
}

async fn health(State(hub): State<Arc<Hub>>) -> Response {
    let accepting = hub.coordinator().is_accepting();
    let report = HealthReport {
        status: if accepting { "ok" } else { "draining" },
        topics: hub.registry().topic_count(),
        members: hub.registry().total_members(),
        sessions: hub.coordinator().live_sessions(),
    };
    let status = if accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn attach(
    Path(topic): Path<String>,
    State(hub): State<Arc<Hub>>,
    mut request: Request,
) -> Response {
    if !hub.coordinator().is_accepting() {
        debug!(topic = %topic, "refusing upgrade during shutdown");
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let Some(accept) = accept_key(request.headers()) else {
        return (StatusCode::BAD_REQUEST, "expected a websocket upgrade").into_response();
    };
    let Some(on_upgrade) = request.extensions_mut().remove::<OnUpgrade>() else {
        return (StatusCode::UPGRADE_REQUIRED, "connection cannot be upgraded").into_response();
    };

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => serve_socket(TokioIo::new(upgraded), hub, topic).await,
            Err(err) => warn!(topic = %topic, error = %err, "upgrade failed"),
        }
    });

    (
        StatusCode::SWITCHING_PROTOCOLS,
        [
            (CONNECTION, "upgrade".to_string()),
            (UPGRADE, "websocket".to_string()),
            (SEC_WEBSOCKET_ACCEPT, accept),
        ],
    )
        .into_response()
}

/// `Sec-WebSocket-Accept` for a valid version 13 upgrade request.
fn accept_key(headers: &HeaderMap) -> Option<String> {
    if !has_token(headers, CONNECTION, "upgrade") || !has_token(headers, UPGRADE, "websocket") {
        return None;
    }
    if headers.get(SEC_WEBSOCKET_VERSION)?.as_bytes() != b"13" {
        return None;
    }
    let key = headers.get(SEC_WEBSOCKET_KEY)?;
    Some(derive_accept_key(key.as_bytes()))
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

async fn serve_socket<S>(socket: S, hub: Arc<Hub>, topic: String)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(socket);
    let (conn, lanes) = hub.open_connection();
    let conn_id = conn.id();

    let mut writer = tokio::spawn(write_frames(Arc::clone(&conn), lanes, frame_sink(write_half)));

    let frames =
        FrameReader::new(BufReader::new(read_half), hub.config().max_text_payload).into_stream();
    let outcome = hub.session(topic, conn).run(frames).await;
    debug!(conn_id = %conn_id, ?outcome, "session finished");

    match timeout(hub.config().grace_period, &mut writer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => debug!(conn_id = %conn_id, error = %err, "writer stopped early"),
        Ok(Err(err)) => warn!(conn_id = %conn_id, error = %err, "writer task failed"),
        Err(_) => {
            warn!(conn_id = %conn_id, "writer did not flush in time");
            writer.abort();
        }
    }
}
