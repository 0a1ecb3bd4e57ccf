use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_relay::{
    channel::ChannelConfig,
    cli::{Cli, Command, HubArgs},
    hub::{Hub, TcpLinkFactory},
    participant,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn run_hub(args: HubArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let config = ChannelConfig {
        timeout: args.delivery_timeout_ms.map(Duration::from_millis),
    };
    let server = Server::new(listener, Arc::new(Hub::new(TcpLinkFactory::new(config))));
    let addr = server.local_addr()?;
    info!("hub listening on {}", addr);
    server.run_until_ctrl_c().await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Hub(args) => {
            if let Err(err) = run_hub(args).await {
                warn!("hub exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Participant(args) => participant::run(args).await?,
    }

    Ok(())
}
