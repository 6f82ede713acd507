//! End-to-end tests driving `GameServer` and `GameClient` together over
//! real loopback sockets.

use std::{net::IpAddr, sync::Arc, time::Duration};

use engine_client::GameClient;
use engine_server::server::bind_ephemeral;
use engine_shared::prelude::*;

const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

async fn wait_until<F: Fn() -> bool>(timeout: Duration, poll: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Scenario 1: happy-path handshake. Client connects, is assigned an id and
/// fast port, and a subsequent unreliable push is reflected back in a
/// broadcast containing exactly that client's state.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_handshake_and_broadcast() -> anyhow::Result<()> {
    let server = bind_ephemeral(GameId::new("T")).await?;
    server.start().await?;
    let addr = server.reliable_addr()?;

    let client = GameClient::connect(addr.ip(), addr.port(), GameId::new("T"));
    assert!(wait_until(Duration::from_secs(2), Duration::from_millis(20), || client.connected()).await);
    let client_id = client.id().await.expect("id assigned after handshake");

    client.send_update(serde_json::json!({"pos": [1, 2]})).await;

    let mut observed = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        let state = client.get_latest_state().await;
        if state.contains_key(&client_id) {
            observed = Some(state);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let state = observed.expect("expected to observe our own pushed state in a broadcast");
    assert_eq!(state.get(&client_id), Some(&serde_json::json!({"pos": [1, 2]})));

    client.stop().await;
    server.stop().await;
    Ok(())
}

/// Scenario 2: a mismatched game_id is rejected and no id is ever assigned.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn game_id_mismatch_never_connects() -> anyhow::Result<()> {
    let server = bind_ephemeral(GameId::new("A")).await?;
    server.start().await?;
    let addr = server.reliable_addr()?;

    let client = GameClient::connect(addr.ip(), addr.port(), GameId::new("B"));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!client.connected());
    assert!(client.id().await.is_none());

    client.stop().await;
    server.stop().await;
    Ok(())
}

/// Scenario 3: disconnect on silence. After a successful handshake, killing
/// the server means the client observes `connected = false` within a bit
/// more than `DISCONNECT_TIMEOUT`.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_timeout_flips_connected_false() -> anyhow::Result<()> {
    let server = bind_ephemeral(GameId::new("T")).await?;
    server.start().await?;
    let addr = server.reliable_addr()?;

    let client = GameClient::connect(addr.ip(), addr.port(), GameId::new("T"));
    assert!(wait_until(Duration::from_secs(2), Duration::from_millis(20), || client.connected()).await);

    server.stop().await;

    let disconnected = wait_until(Duration::from_secs(8), Duration::from_millis(100), || {
        !client.connected()
    })
    .await;
    assert!(
        disconnected,
        "client should observe disconnect within ~6s of the server going away"
    );

    client.stop().await;
    Ok(())
}

/// Scenario 4: two clients connect, each pushes distinct state, and each
/// observes a merged mapping keyed by both client ids.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_client_state_merge() -> anyhow::Result<()> {
    let server = bind_ephemeral(GameId::new("T")).await?;
    server.start().await?;
    let addr = server.reliable_addr()?;

    let c1 = GameClient::connect(addr.ip(), addr.port(), GameId::new("T"));
    let c2 = GameClient::connect(addr.ip(), addr.port(), GameId::new("T"));
    assert!(wait_until(Duration::from_secs(2), Duration::from_millis(20), || c1.connected()).await);
    assert!(wait_until(Duration::from_secs(2), Duration::from_millis(20), || c2.connected()).await);

    let id1 = c1.id().await.unwrap();
    let id2 = c2.id().await.unwrap();
    assert_ne!(id1, id2, "unique ids across sessions");

    c1.send_update(serde_json::json!({"pos": [1, 2]})).await;
    c2.send_update(serde_json::json!({"pos": [3, 4]})).await;

    let mut merged = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        let state = c1.get_latest_state().await;
        if state.contains_key(&id1) && state.contains_key(&id2) {
            merged = Some(state);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let merged = merged.expect("expected both clients' state to appear in c1's merged view");

    assert_eq!(merged.len(), 2);
    assert_eq!(merged.get(&id1), Some(&serde_json::json!({"pos": [1, 2]})));
    assert_eq!(merged.get(&id2), Some(&serde_json::json!({"pos": [3, 4]})));

    c1.stop().await;
    c2.stop().await;
    server.stop().await;
    Ok(())
}

/// Scenario 5: discovery roundtrip. A LAN-discovery server advertises its
/// `game_id`/`reliable_port`; a scan picks it up.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovery_roundtrip_finds_the_host() -> anyhow::Result<()> {
    let discovery: Arc<dyn DiscoveryService> = Arc::new(LanDiscovery::new());
    let server =
        engine_server::GameServer::bind(LOCALHOST, 0, GameId::new("T"), Arc::clone(&discovery)).await?;
    server.start().await?;
    let reliable_port = server.reliable_addr()?.port();

    let scanner = LanDiscovery::new();
    let hosts = scanner.find(&GameId::new("T"), Duration::from_secs(3)).await?;

    assert!(
        hosts
            .iter()
            .any(|h| h.reliable_port == reliable_port && h.game_id == GameId::new("T")),
        "expected to discover the server we just started: {hosts:?}"
    );

    server.stop().await;
    Ok(())
}
