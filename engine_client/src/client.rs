//! Client implementation.
//!
//! [`GameClient::connect`] returns immediately; the reliable handshake and
//! the unreliable fast-listener setup run on a spawned task so that a
//! caller driving a synchronous frame loop (see `engine_scene`) can poll
//! [`GameClient::id`] with a bounded wait instead of blocking the frame
//! thread on network I/O.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use engine_shared::prelude::*;
use tokio::{net::TcpStream, sync::Mutex, task::JoinHandle, time};
use tracing::{debug, info, warn};

/// How long the initial TCP connect is allowed to take before giving up.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(7);
/// Soft timeout on each unreliable receive; feeds the heartbeat check.
pub const UDP_SOCKET_TIMEOUT: Duration = Duration::from_secs(1);
/// No well-formed datagram observed within this window => disconnected.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct ClientShared {
    id: Mutex<Option<ClientId>>,
    server_fast_port: Mutex<Option<u16>>,
    latest_state: Mutex<GameState>,
    last_packet_time: Mutex<Instant>,
    connected: AtomicBool,
}

impl ClientShared {
    fn new() -> Self {
        Self {
            id: Mutex::new(None),
            server_fast_port: Mutex::new(None),
            latest_state: Mutex::new(GameState::new()),
            last_packet_time: Mutex::new(Instant::now()),
            connected: AtomicBool::new(false),
        }
    }
}

/// Client half of the session runtime. Observable surface to a `Scene`:
/// [`GameClient::id`], [`GameClient::connected`], [`GameClient::get_latest_state`],
/// [`GameClient::send_update`], [`GameClient::stop`].
pub struct GameClient {
    shared: Arc<ClientShared>,
    running: Arc<AtomicBool>,
    reliable: Arc<Mutex<Option<ReliableConn>>>,
    fast: Arc<Mutex<Option<Arc<UnreliableConn>>>>,
    listener: Arc<Mutex<Option<JoinHandle<()>>>>,
    handshake: Mutex<Option<JoinHandle<()>>>,
}

impl GameClient {
    /// Construction is also connection: spawns the handshake immediately
    /// and returns. `connected()` is false and `id()` is `None` until (and
    /// unless) the handshake succeeds.
    pub fn connect(host: IpAddr, reliable_port: u16, game_id: GameId) -> Self {
        let shared = Arc::new(ClientShared::new());
        let running = Arc::new(AtomicBool::new(true));
        let reliable = Arc::new(Mutex::new(None));
        let fast = Arc::new(Mutex::new(None));
        let listener = Arc::new(Mutex::new(None));

        let handshake = tokio::spawn(run_handshake(
            host,
            reliable_port,
            game_id,
            Arc::clone(&shared),
            Arc::clone(&running),
            Arc::clone(&reliable),
            Arc::clone(&fast),
            Arc::clone(&listener),
        ));

        Self {
            shared,
            running,
            reliable,
            fast,
            listener,
            handshake: Mutex::new(Some(handshake)),
        }
    }

    /// The id assigned during handshake, once it completes successfully.
    pub async fn id(&self) -> Option<ClientId> {
        *self.shared.id.lock().await
    }

    /// False before the handshake completes, after a handshake failure,
    /// after the reliable/unreliable channel closes, and after a heartbeat
    /// timeout.
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// A snapshot copy of the most recently received aggregated state.
    pub async fn get_latest_state(&self) -> GameState {
        self.shared.latest_state.lock().await.clone()
    }

    /// Pushes `payload` to the server. No-ops silently if not connected,
    /// not yet id-assigned, or stopped.
    pub async fn send_update(&self, payload: Payload) {
        if !self.running.load(Ordering::SeqCst) || !self.connected() {
            return;
        }
        let Some(client_id) = *self.shared.id.lock().await else {
            return;
        };
        let fast = self.fast.lock().await;
        let Some(fast) = fast.as_ref() else {
            return;
        };
        if let Err(e) = fast.send(&NetMsg::Update { client_id, payload }).await {
            debug!(error = %e, "send_update failed");
        }
    }

    /// Stops the client: aborts the handshake/listener tasks if still
    /// running and closes the reliable stream. Idempotent.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(h) = self.handshake.lock().await.take() {
            h.abort();
        }
        if let Some(h) = self.listener.lock().await.take() {
            h.abort();
        }
        if let Some(mut conn) = self.reliable.lock().await.take() {
            let _ = conn.shutdown().await;
        }
        self.fast.lock().await.take();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_handshake(
    host: IpAddr,
    reliable_port: u16,
    game_id: GameId,
    shared: Arc<ClientShared>,
    running: Arc<AtomicBool>,
    reliable_slot: Arc<Mutex<Option<ReliableConn>>>,
    fast_slot: Arc<Mutex<Option<Arc<UnreliableConn>>>>,
    listener_slot: Arc<Mutex<Option<JoinHandle<()>>>>,
) {
    let addr = SocketAddr::new(host, reliable_port);
    let stream = match time::timeout(CONNECTION_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(error = %e, %addr, "reliable connect failed");
            return;
        }
        Err(_) => {
            debug!(%addr, "reliable connect timed out");
            return;
        }
    };

    let mut reliable = ReliableConn::new(stream);
    if let Err(e) = reliable.send(&NetMsg::Hello { game_id }).await {
        debug!(error = %e, "handshake send failed");
        return;
    }

    let (client_id, fast_port) = match reliable.recv().await {
        Ok(NetMsg::Welcome {
            client_id,
            fast_port,
        }) => (client_id, fast_port),
        Ok(other) => {
            warn!(?other, "unexpected handshake reply");
            return;
        }
        Err(e) => {
            debug!(error = %e, "handshake read failed");
            return;
        }
    };

    let bind_ip = match host {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let fast_conn = match UnreliableConn::connect(
        SocketAddr::new(bind_ip, 0),
        SocketAddr::new(host, fast_port),
    )
    .await
    {
        Ok(c) => Arc::new(c),
        Err(e) => {
            warn!(error = %e, "failed to open unreliable socket");
            return;
        }
    };

    *shared.id.lock().await = Some(client_id);
    *shared.server_fast_port.lock().await = Some(fast_port);
    *shared.last_packet_time.lock().await = Instant::now();
    shared.connected.store(true, Ordering::SeqCst);
    *reliable_slot.lock().await = Some(reliable);
    *fast_slot.lock().await = Some(Arc::clone(&fast_conn));

    let handle = spawn_fast_listener(fast_conn, Arc::clone(&shared), running, client_id);
    *listener_slot.lock().await = Some(handle);

    info!(%client_id, fast_port, "connected");
}

/// Sends the registration datagram, then loops receiving the aggregated
/// state until stopped or a heartbeat timeout / fatal socket error.
fn spawn_fast_listener(
    fast: Arc<UnreliableConn>,
    shared: Arc<ClientShared>,
    running: Arc<AtomicBool>,
    client_id: ClientId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = fast
            .send(&NetMsg::Update {
                client_id,
                payload: Payload::Null,
            })
            .await
        {
            warn!(error = %e, "registration datagram failed");
        }

        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            match fast.recv_timeout(UDP_SOCKET_TIMEOUT).await {
                Ok(Some(NetMsg::Snapshot(state))) => {
                    *shared.latest_state.lock().await = state;
                    *shared.last_packet_time.lock().await = Instant::now();
                }
                Ok(Some(_other)) => {
                    // Unexpected message type on the fast channel; ignore.
                }
                Ok(None) => {
                    let last = *shared.last_packet_time.lock().await;
                    if last.elapsed() > DISCONNECT_TIMEOUT {
                        debug!(error = %NetError::HeartbeatTimeout, %client_id, "no packet within disconnect window");
                        shared.connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                Err(e) => {
                    let is_decode_error = e
                        .downcast_ref::<NetError>()
                        .is_some_and(|ne| matches!(ne, NetError::Decode(_)));
                    if is_decode_error {
                        continue;
                    }
                    debug!(error = %e, "fast listener socket error");
                    shared.connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    })
}
