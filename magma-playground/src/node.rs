use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use itertools::Itertools;
use tracing::{info, warn, Level};

use magma_cman::event::ClusterEvent;
use magma_cman::ext::init_logger;
use magma_cman::lockspace::{LockFlags, LockHandle, LockMode};
use magma_cman::plugin::CmanPlugin;
use magma_playground::load_config;

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    name: Option<String>,
    #[arg(short, long)]
    addr: Option<SocketAddr>,
    #[arg(short, long)]
    group: Option<String>,
    /// Resource to hold an exclusive lock on while the cluster is quorate.
    #[arg(short, long)]
    lock: Option<String>,
}

async fn print_members(plugin: &mut CmanPlugin) -> anyhow::Result<()> {
    let members = plugin.member_list(None).await?;
    info!("members [{}]", members.iter().join(", "));
    Ok(())
}

async fn acquire(plugin: &mut CmanPlugin, resource: &Option<String>, held: &mut Option<LockHandle>) {
    let (Some(resource), None) = (resource, held.as_ref()) else {
        return;
    };
    match plugin.lock(resource, LockMode::Exclusive, LockFlags::default()).await {
        Ok(handle) => {
            info!("holding {}", resource);
            *held = Some(handle);
        }
        Err(error) => {
            warn!("lock {} error {:?}", resource, error);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger(Level::INFO);
    let Args { config, name, addr, group, lock } = Args::parse();
    let mut config = load_config(config)?;
    if let Some(name) = name {
        config.client.node_name = name;
    }
    if let Some(addr) = addr {
        config.client.addr = addr;
    }
    let mut plugin = CmanPlugin::from_config(&config).await?;
    plugin.null()?;
    info!("{}", plugin.version());
    plugin.open().await?;
    if let Some(group) = &group {
        plugin.login(group).await?;
    }
    print_members(&mut plugin).await?;
    let mut held = None;
    if plugin.private().quorum_state().is_quorate() {
        acquire(&mut plugin, &lock, &mut held).await;
    }
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let shutdown = loop {
        tokio::select! {
            _ = &mut ctrl_c => break false,
            event = plugin.get_event(None) => match event? {
                ClusterEvent::MembershipChange => print_members(&mut plugin).await?,
                ClusterEvent::Quorate => acquire(&mut plugin, &lock, &mut held).await,
                ClusterEvent::Inquorate => warn!("cluster lost quorum"),
                ClusterEvent::Shutdown => break true,
                ClusterEvent::Null => {}
            },
        }
    };
    if let Some(handle) = held.take() {
        plugin.unlock(handle).await?;
    }
    if group.is_some() && !shutdown {
        plugin.logout().await?;
    }
    if let Some(error) = plugin.close().await.err() {
        warn!("close plugin error {:?}", error);
    }
    Ok(())
}
