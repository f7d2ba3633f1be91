use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};

use magma_cman::ext::init_logger;
use magma_cman::service::CmanService;
use magma_playground::load_config;

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    listen: Option<SocketAddr>,
    #[arg(short, long)]
    expected_votes: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger(Level::INFO);
    let Args { config, listen, expected_votes } = Args::parse();
    let mut config = load_config(config)?;
    if let Some(listen) = listen {
        config.service.listen = listen;
    }
    if let Some(expected_votes) = expected_votes {
        config.service.expected_votes = expected_votes;
    }
    let handle = CmanService::bind(&config.service).await?.spawn()?;
    info!("cmand expecting {} votes", config.service.expected_votes);
    tokio::signal::ctrl_c().await?;
    handle.shutdown();
    handle.wait().await;
    Ok(())
}
