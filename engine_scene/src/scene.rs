//! Bridges a synchronous, frame-driven game loop to the async client/server
//! runtime.
//!
//! A `Scene` is plugged into a host game engine that calls its `process`
//! hook once per frame. The hook never blocks on network I/O: all of that
//! happens on the listener tasks owned by [`GameClient`]. Per frame the
//! scene follows receive-then-send order so the local step sees the
//! freshest remote state before computing what to transmit.

use std::{net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use engine_client::GameClient;
use engine_server::GameServer;
use engine_shared::prelude::*;
use tokio::time;

/// Bounded wait for the handshake to complete during scene construction.
pub const ID_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
pub const ID_WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// Game-specific hooks a `Scene` drives once per frame. Implementations
/// never block: `get_local_state`/`handle_network_state` run on the frame
/// thread and should only touch in-memory game state.
pub trait GameLogic: Send {
    /// Called each frame with a snapshot of the aggregated world state.
    /// Only invoked when the client has received at least one update.
    fn handle_network_state(&mut self, state: GameState);

    /// Called each frame to get this frame's local state to push.
    /// `None` means "nothing to send this frame".
    fn get_local_state(&mut self) -> Option<Payload>;

    /// Called once when the client's `connected` flips to false. Returns
    /// whether the scene should stop itself afterward; the default is `true`
    /// (stop), matching the framework's default behavior. Override to react
    /// (e.g. show a disconnect screen) and return `false` to keep the scene
    /// running instead, e.g. for a custom reconnect flow.
    fn on_server_disconnect(&mut self) -> bool {
        true
    }
}

/// Common surface the host game loop drives, regardless of whether this
/// process is also running the server.
#[async_trait]
pub trait NetworkScene: Send {
    /// The per-frame hook. Receive-then-send: pulls the freshest remote
    /// state before asking the game for what to transmit this frame.
    async fn process(&mut self);

    /// Tears the scene (and, for a host, its server) down. Idempotent.
    async fn stop(&mut self);

    /// Whether the handshake completed within `ID_WAIT_TIMEOUT`.
    fn connection_successful(&self) -> bool;

    /// Whether `process` is now a no-op because the scene has stopped.
    fn stopped(&self) -> bool;
}

/// A scene that is purely a client of someone else's server.
pub struct ClientScene<G: GameLogic> {
    client: GameClient,
    logic: G,
    connection_successful: bool,
    stopped: bool,
}

impl<G: GameLogic> ClientScene<G> {
    /// Connects to `(host, reliable_port)` and waits up to
    /// [`ID_WAIT_TIMEOUT`] for the handshake to complete.
    pub async fn connect(host: IpAddr, reliable_port: u16, game_id: GameId, logic: G) -> Self {
        let client = GameClient::connect(host, reliable_port, game_id);
        let connection_successful = wait_for_id(&client).await;
        Self {
            client,
            logic,
            connection_successful,
            stopped: false,
        }
    }
}

#[async_trait]
impl<G: GameLogic> NetworkScene for ClientScene<G> {
    async fn process(&mut self) {
        if self.stopped {
            return;
        }

        if !self.client.connected() {
            if self.logic.on_server_disconnect() {
                self.stopped = true;
            }
            return;
        }

        let state = self.client.get_latest_state().await;
        if !state.is_empty() {
            self.logic.handle_network_state(state);
        }

        if self.client.id().await.is_some() {
            if let Some(payload) = self.logic.get_local_state() {
                self.client.send_update(payload).await;
            }
        }
    }

    async fn stop(&mut self) {
        self.stopped = true;
        self.client.stop().await;
    }

    fn connection_successful(&self) -> bool {
        self.connection_successful
    }

    fn stopped(&self) -> bool {
        self.stopped
    }
}

/// A scene that also owns the authoritative [`GameServer`] and participates
/// in its own game as an ordinary client over loopback.
pub struct HostScene<G: GameLogic> {
    server: GameServer,
    client_scene: ClientScene<G>,
}

impl<G: GameLogic> HostScene<G> {
    /// Starts `server` (binding its listeners and discovery advertising),
    /// then connects a local client to `127.0.0.1:<the server's reliable port>`
    /// and waits up to [`ID_WAIT_TIMEOUT`] for that loopback handshake.
    pub async fn start(
        bind_ip: IpAddr,
        reliable_port: u16,
        game_id: GameId,
        discovery: Arc<dyn DiscoveryService>,
        logic: G,
    ) -> anyhow::Result<Self> {
        let server = GameServer::bind(bind_ip, reliable_port, game_id.clone(), discovery).await?;
        server.start().await?;
        let actual_port = server.reliable_addr()?.port();

        let client_scene = ClientScene::connect(
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            actual_port,
            game_id,
            logic,
        )
        .await;

        Ok(Self {
            server,
            client_scene,
        })
    }

    pub fn server(&self) -> &GameServer {
        &self.server
    }
}

#[async_trait]
impl<G: GameLogic> NetworkScene for HostScene<G> {
    async fn process(&mut self) {
        self.client_scene.process().await;
    }

    async fn stop(&mut self) {
        self.client_scene.stop().await;
        self.server.stop().await;
    }

    fn connection_successful(&self) -> bool {
        self.client_scene.connection_successful()
    }

    fn stopped(&self) -> bool {
        self.client_scene.stopped()
    }
}

async fn wait_for_id(client: &GameClient) -> bool {
    let deadline = time::Instant::now() + ID_WAIT_TIMEOUT;
    loop {
        if client.id().await.is_some() {
            return true;
        }
        if time::Instant::now() >= deadline {
            return false;
        }
        time::sleep(ID_WAIT_INTERVAL).await;
    }
}
