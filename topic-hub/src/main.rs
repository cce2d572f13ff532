use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use topic_hub::{
    cli::{Cli, Command},
    client,
    config::HubConfig,
    hub::Hub,
    server::Server,
};

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Serve(args) => {
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let server = Server::new(listener, Hub::new(HubConfig::from(&args)));
            let addr = server.local_addr()?;
            info!("hub listening on {}", addr);
            match server.run_until_signal().await {
                Ok(report) => info!(
                    closed = report.closed,
                    abandoned = report.abandoned,
                    "hub stopped"
                ),
                Err(err) => {
                    warn!("hub exited with error: {err:?}");
                    return Err(err);
                }
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
