//! Standalone session server binary.
//!
//! Usage:
//!   cargo run -p engine_server -- [--addr 127.0.0.1] [--port 12345] [--game-id mygame] [--no-discovery]
//!
//! Binds the reliable listener and the unreliable socket, starts LAN
//! discovery advertising (unless disabled), and runs until Ctrl-C.

use std::{env, net::IpAddr, sync::Arc};

use anyhow::Context;
use engine_server::GameServer;
use engine_shared::prelude::*;
use tracing::info;

struct Args {
    bind_ip: IpAddr,
    reliable_port: u16,
    game_id: GameId,
    discovery_enabled: bool,
    config: EngineConfig,
}

fn parse_args() -> Args {
    let mut cfg = EngineConfig::default();
    let mut discovery_enabled = cfg.discovery_enabled;
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.host = args[i + 1].clone();
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                cfg.reliable_port = args[i + 1].parse().unwrap_or(cfg.reliable_port);
                i += 2;
            }
            "--game-id" if i + 1 < args.len() => {
                cfg.game_id = GameId::new(args[i + 1].clone());
                i += 2;
            }
            "--no-discovery" => {
                discovery_enabled = false;
                i += 1;
            }
            _ => i += 1,
        }
    }

    Args {
        bind_ip: cfg.host.parse().unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        reliable_port: cfg.reliable_port,
        game_id: cfg.game_id.clone(),
        discovery_enabled,
        config: cfg,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let discovery: Arc<dyn DiscoveryService> = if args.discovery_enabled {
        Arc::new(LanDiscovery::new())
    } else {
        Arc::new(NoopDiscovery)
    };

    let server = GameServer::bind(args.bind_ip, args.reliable_port, args.game_id.clone(), discovery)
        .await
        .context("bind server")?;
    let reliable_addr = server.reliable_addr()?;
    info!(
        configured_bind = %args.config.bind_addr(),
        %reliable_addr,
        fast_port = server.fast_port(),
        game_id = %args.game_id,
        "server listening"
    );

    server.start().await.context("start server")?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    server.stop().await;

    Ok(())
}
