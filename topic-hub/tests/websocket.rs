use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, http::StatusCode, Message},
    MaybeTlsStream, WebSocketStream,
};
use topic_hub::{
    config::HubConfig,
    hub::Hub,
    keepalive::PongReply,
    server::{router, Server},
    shutdown::DrainReport,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(3);
const QUIET_WINDOW: Duration = Duration::from_millis(300);

struct RunningHub {
    addr: SocketAddr,
    hub: Arc<Hub>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<DrainReport>>,
}

impl RunningHub {
    async fn start(config: HubConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, Hub::new(config));
        let addr = server.local_addr()?;
        let hub = Arc::clone(server.hub());
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));
        Ok(Self {
            addr,
            hub,
            stop,
            task,
        })
    }

    async fn connect(&self, topic: &str) -> Result<Client> {
        let url = format!("ws://{}/{}", self.addr, topic);
        let (client, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        Ok(client)
    }

    async fn wait_for_members(&self, topic: &str, count: usize) -> Result<()> {
        timeout(STEP, async {
            while self.hub.registry().member_count(topic) != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| anyhow!("{topic} never reached {count} members"))
    }

    async fn stop(self) -> Result<DrainReport> {
        let _ = self.stop.send(());
        timeout(STEP, self.task).await??
    }
}

async fn next_text(client: &mut Client) -> Result<String> {
    loop {
        let message = timeout(STEP, client.next())
            .await
            .map_err(|_| anyhow!("timed out waiting for text"))?
            .context("stream ended")??;
        match message {
            Message::Text(text) => return Ok(text),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return Err(anyhow!("unexpected message {other:?}")),
        }
    }
}

async fn expect_no_text(client: &mut Client) -> Result<()> {
    match timeout(QUIET_WINDOW, next_text(client)).await {
        Err(_) => Ok(()),
        Ok(Ok(text)) => Err(anyhow!("unexpected text '{text}'")),
        Ok(Err(err)) => Err(err),
    }
}

async fn wait_for_pong(client: &mut Client, expected: &[u8]) -> Result<()> {
    match client.next().await.context("stream ended before pong")?? {
        Message::Pong(payload) if payload == expected => Ok(()),
        other => Err(anyhow!("expected pong {expected:?}, got {other:?}")),
    }
}

#[tokio::test]
async fn text_reaches_topic_peers_but_not_the_publisher() -> Result<()> {
    let hub = RunningHub::start(HubConfig::default()).await?;
    let mut alice = hub.connect("room").await?;
    let mut bob = hub.connect("room").await?;
    let mut carol = hub.connect("lobby").await?;
    hub.wait_for_members("room", 2).await?;
    hub.wait_for_members("lobby", 1).await?;

    alice.send(Message::Text("hello room".into())).await?;

    assert_eq!(next_text(&mut bob).await?, "hello room");
    expect_no_text(&mut alice).await?;
    expect_no_text(&mut carol).await?;

    hub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn ping_is_answered_with_the_configured_pong() -> Result<()> {
    let hub = RunningHub::start(HubConfig {
        pong_reply: PongReply::Fixed(b"thanks to ping!".to_vec()),
        ..HubConfig::default()
    })
    .await?;
    let mut client = hub.connect("room").await?;
    hub.wait_for_members("room", 1).await?;

    client.send(Message::Ping(b"hb".to_vec())).await?;

    timeout(STEP, wait_for_pong(&mut client, b"thanks to ping!"))
        .await
        .map_err(|_| anyhow!("timed out waiting for pong"))??;
    // The responder is the only source of pongs.
    match timeout(QUIET_WINDOW, client.next()).await {
        Err(_) => {}
        Ok(other) => return Err(anyhow!("unexpected second reply {other:?}")),
    }

    hub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn oversized_text_is_dropped_and_the_connection_survives() -> Result<()> {
    let hub = RunningHub::start(HubConfig {
        max_text_payload: 16,
        ..HubConfig::default()
    })
    .await?;
    let mut alice = hub.connect("room").await?;
    let mut bob = hub.connect("room").await?;
    hub.wait_for_members("room", 2).await?;

    alice.send(Message::Text("x".repeat(24))).await?;
    alice.send(Message::Text("small".into())).await?;

    assert_eq!(next_text(&mut bob).await?, "small");
    assert_eq!(hub.hub.registry().member_count("room"), 2);

    hub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn text_far_over_the_ceiling_is_skipped_without_disconnecting() -> Result<()> {
    let hub = RunningHub::start(HubConfig {
        max_text_payload: 16,
        ..HubConfig::default()
    })
    .await?;
    let mut alice = hub.connect("room").await?;
    let mut bob = hub.connect("room").await?;
    hub.wait_for_members("room", 2).await?;

    alice.send(Message::Text("x".repeat(40))).await?;
    alice.send(Message::Text("y".repeat(70_000))).await?;
    alice.send(Message::Text("small".into())).await?;

    assert_eq!(next_text(&mut bob).await?, "small");
    assert_eq!(hub.hub.registry().member_count("room"), 2);
    // Alice is still attached: no close frame, and she can still receive.
    expect_no_text(&mut alice).await?;
    bob.send(Message::Text("still here".into())).await?;
    assert_eq!(next_text(&mut alice).await?, "still here");

    hub.stop().await?;
    Ok(())
}

#[tokio::test]
async fn disconnecting_client_leaves_its_topic() -> Result<()> {
    let hub = RunningHub::start(HubConfig::default()).await?;
    let alice = hub.connect("room").await?;
    let mut bob = hub.connect("room").await?;
    hub.wait_for_members("room", 2).await?;

    drop(alice);
    hub.wait_for_members("room", 1).await?;

    bob.close(None).await?;
    hub.wait_for_members("room", 0).await?;

    let report = hub.stop().await?;
    assert_eq!(report.closed, 0);
    Ok(())
}

#[tokio::test]
async fn shutdown_sends_close_to_every_client() -> Result<()> {
    let hub = RunningHub::start(HubConfig {
        grace_period: Duration::from_secs(1),
        ..HubConfig::default()
    })
    .await?;
    let mut alice = hub.connect("room").await?;
    let mut bob = hub.connect("lobby").await?;
    hub.wait_for_members("room", 1).await?;
    hub.wait_for_members("lobby", 1).await?;

    let registry = Arc::clone(hub.hub.registry());
    let report = hub.stop().await?;

    assert_eq!(report.closed, 2);
    assert_eq!(report.abandoned, 0);
    assert!(registry.all_members().is_empty());
    for client in [&mut alice, &mut bob] {
        let message = timeout(STEP, client.next()).await?;
        assert!(
            matches!(message, Some(Ok(Message::Close(_))) | None),
            "expected close, got {message:?}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn upgrades_are_refused_once_draining() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let hub = Hub::new(HubConfig::default());
    // Plain serve without graceful shutdown keeps the listener open.
    let app = router(Arc::clone(&hub));
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    hub.coordinator().drain();

    let url = format!("ws://{addr}/room");
    match connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        Err(err) => return Err(anyhow!("unexpected error {err}")),
        Ok(_) => return Err(anyhow!("upgrade accepted while draining")),
    }
    assert_eq!(hub.registry().total_members(), 0);

    server.abort();
    Ok(())
}
