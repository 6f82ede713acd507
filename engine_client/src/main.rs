//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- [--addr 127.0.0.1] [--port 12345] [--game-id mygame]
//!
//! Connects, waits for the handshake, then pushes an incrementing counter
//! as its local state once a second and prints the aggregated state it
//! receives back. Exits when the connection drops.

use std::{env, net::IpAddr, time::Duration};

use engine_client::GameClient;
use engine_shared::prelude::*;
use tracing::info;

struct Args {
    host: IpAddr,
    reliable_port: u16,
    game_id: GameId,
    config: EngineConfig,
}

fn parse_args() -> Args {
    let mut cfg = EngineConfig::default();
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
            _ => i += 1,
        }
    }

    Args {
        host: cfg.host.parse().unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        reliable_port: cfg.reliable_port,
        game_id: cfg.game_id.clone(),
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
    info!(target = %args.config.bind_addr(), game_id = %args.game_id, "connecting");
    let client = GameClient::connect(args.host, args.reliable_port, args.game_id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.id().await.is_none() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let Some(id) = client.id().await else {
        println!("failed to connect");
        return Ok(());
    };
    info!(%id, "connected");

    let mut counter: u64 = 0;
    loop {
        if !client.connected() {
            println!("disconnected from server");
            break;
        }

        client.send_update(serde_json::json!({ "counter": counter })).await;
        counter += 1;

        let state = client.get_latest_state().await;
        info!(clients = state.len(), "received state");

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    client.stop().await;
    Ok(())
}
