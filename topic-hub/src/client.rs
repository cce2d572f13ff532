use std::time::Duration;

use anyhow::{Context, Result};
use futures::{stream::SplitSink, stream::SplitStream, Sink, SinkExt, Stream, StreamExt};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::TcpStream,
    select,
    time::{interval, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::cli::ClientArgs;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWriter = SplitSink<Socket, Message>;
type SocketReader = SplitStream<Socket>;

const PING_PAYLOAD: &[u8] = b"ping";

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut writer, mut reader) = establish_connection(&args).await?;
    write_stdout(&format!("*** attached to {}", args.topic)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut heartbeat = interval(Duration::from_secs(args.ping_interval_secs.max(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    heartbeat.tick().await;

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut heartbeat).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(SocketWriter, SocketReader)> {
    let url = format!("ws://{}/{}", args.server, args.topic);
    let (socket, _response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    info!("connected to {url}");

    Ok(socket.split())
}

async fn run_client_loop<R, W, I>(
    reader: &mut R,
    writer: &mut W,
    stdin: &mut Lines<I>,
    heartbeat: &mut Interval,
) -> Result<()>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
    I: AsyncBufRead + Unpin,
{
    loop {
        select! {
            server_message = reader.next() => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            // next_line keeps a partial line buffered when a heartbeat wins.
            line = stdin.next_line() => {
                if !handle_stdin_input(line, writer).await? {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                writer
                    .send(Message::Ping(PING_PAYLOAD.to_vec()))
                    .await
                    .context("failed to send ping")?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: Option<Result<Message, tungstenite::Error>>,
) -> Result<bool> {
    match message {
        Some(Ok(Message::Text(text))) => {
            write_stdout(&text).await?;
            Ok(true)
        }
        Some(Ok(Message::Pong(payload))) => {
            debug!(pong = %String::from_utf8_lossy(&payload), "pong");
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err).context("failed to read from hub"),
    }
}

async fn handle_stdin_input<W>(line: io::Result<Option<String>>, writer: &mut W) -> Result<bool>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let Some(line) = line? else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving topic").await?;
        return Ok(false);
    }

    writer
        .send(Message::Text(text.to_string()))
        .await
        .context("failed to publish")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut SocketWriter) {
    if let Err(error) = writer.send(Message::Close(None)).await {
        debug!(?error, "failed to send close frame");
    }
    if let Err(error) = writer.close().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
