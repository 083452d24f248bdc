// ABOUTME: Main entry point for the perch echo agent
// ABOUTME: Initializes logging and config, then runs a simple echoing handler

use anyhow::Result;
use clap::Parser;
use perch::{reply_fn, AgentClient, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "perch", about = "Echo agent for the perch gateway")]
struct Args {
    /// Gateway websocket URL (overrides config and PERCH_GATEWAY_URL)
    #[arg(long)]
    url: Option<String>,

    /// Agent display name sent in the auth handshake
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::load()?;
    if let Some(url) = args.url {
        config.gateway.url = url;
    }
    if let Some(name) = args.name {
        config.gateway.agent_name = Some(name);
    }

    tracing::info!(
        gateway = %config.gateway.url,
        agent_name = ?config.gateway.agent_name,
        "Configuration loaded"
    );

    let handler = reply_fn(|ctx| async move {
        Ok(format!("{} said: {}", ctx.user.display(), ctx.prompt))
    });

    let client = AgentClient::new(&config, handler)?;
    let shutdown = client.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    client.run().await
}
