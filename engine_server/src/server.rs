//! Authoritative session server.
//!
//! Owns the reliable listener and the unreliable ("fast") socket, runs the
//! per-client handshake, and broadcasts the merged `game_state` to every
//! registered client whenever it changes.
//!
//! Three independent activities run once [`GameServer::start`] is called:
//! the acceptor (spawns one handshake task per reliable connection), the
//! fast receiver (decodes unreliable datagrams and broadcasts), and
//! discovery advertising. A panic or error in one never stalls another.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use engine_shared::prelude::*;
use tokio::{net::UdpSocket, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bookkeeping for one handshake-complete session. The reliable stream
/// itself lives on the session task's stack, not here; this just lets
/// `status`-style introspection see who's connected.
struct SessionInfo {
    #[allow(dead_code)]
    connected_at: Instant,
}

#[derive(Default)]
struct ServerState {
    game_state: GameState,
    client_map: HashMap<ClientId, SocketAddr>,
    sessions: HashMap<ClientId, SessionInfo>,
}

/// The authoritative session server described in the networking runtime:
/// reliable handshake + identity assignment, unreliable state broadcast,
/// heartbeat-free session teardown on stream close.
pub struct GameServer {
    game_id: GameId,
    tcp: std::sync::Mutex<Option<Arc<ReliableListener>>>,
    fast: std::sync::Mutex<Option<Arc<UdpSocket>>>,
    fast_port: u16,
    state: Arc<Mutex<ServerState>>,
    discovery: Arc<dyn DiscoveryService>,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl GameServer {
    /// Binds the reliable listener on `(bind_ip, reliable_port)` and an
    /// unreliable socket on an OS-chosen ephemeral port. Bind failures are
    /// fatal and surface to the caller as [`NetError::ConfigError`].
    pub async fn bind(
        bind_ip: IpAddr,
        reliable_port: u16,
        game_id: GameId,
        discovery: Arc<dyn DiscoveryService>,
    ) -> anyhow::Result<Self> {
        let addr = SocketAddr::new(bind_ip, reliable_port);
        let tcp = ReliableListener::bind(addr).await?;
        let fast = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
            .await
            .map_err(|e| NetError::ConfigError(e.to_string()))?;
        let fast_port = fast.local_addr()?.port();

        Ok(Self {
            game_id,
            tcp: std::sync::Mutex::new(Some(Arc::new(tcp))),
            fast: std::sync::Mutex::new(Some(Arc::new(fast))),
            fast_port,
            state: Arc::new(Mutex::new(ServerState::default())),
            discovery,
            cancel: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// The reliable listener's bound address (use `.port()` once bound to 0).
    /// Errors once [`GameServer::stop`] has closed the listener.
    pub fn reliable_addr(&self) -> anyhow::Result<SocketAddr> {
        let tcp = self
            .tcp
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("server has been stopped"))?;
        tcp.local_addr()
    }

    /// The ephemeral port the unreliable socket is bound to; this is what
    /// gets handed to clients in the `Welcome` message.
    pub fn fast_port(&self) -> u16 {
        self.fast_port
    }

    /// Spawns the acceptor, fast receiver, and discovery advertising. Each
    /// runs until [`GameServer::stop`] is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let reliable_port = self.reliable_addr()?.port();
        self.discovery
            .start_advertising(self.game_id.clone(), reliable_port)
            .await?;

        let acceptor = self.spawn_acceptor();
        let receiver = self.spawn_fast_receiver();
        self.tasks.lock().unwrap().extend([acceptor, receiver]);
        Ok(())
    }

    fn spawn_acceptor(&self) -> JoinHandle<()> {
        let tcp = self.tcp.lock().unwrap().clone();
        let cancel = self.cancel.clone();
        let game_id = self.game_id.clone();
        let fast_port = self.fast_port;
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let Some(tcp) = tcp else { return };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = tcp.accept() => {
                        match accepted {
                            Ok((conn, peer)) => {
                                let game_id = game_id.clone();
                                let state = Arc::clone(&state);
                                let session_cancel = cancel.clone();
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        run_session(conn, peer, game_id, fast_port, state, session_cancel)
                                            .await
                                    {
                                        debug!(error = %e, %peer, "session ended");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "acceptor error, stopping");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_fast_receiver(&self) -> JoinHandle<()> {
        let fast = self.fast.lock().unwrap().clone();
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let Some(fast) = fast else { return };
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    recvd = fast.recv_from(&mut buf) => {
                        match recvd {
                            Ok((n, from)) => {
                                let Ok(msg) = decode_from_bytes(&buf[..n]) else {
                                    continue;
                                };
                                let NetMsg::Update { client_id, payload } = msg else {
                                    continue;
                                };

                                let snapshot = {
                                    let mut s = state.lock().await;
                                    s.client_map.entry(client_id).or_insert(from);
                                    s.game_state.insert(client_id, payload);
                                    s.game_state.clone()
                                };
                                broadcast(&fast, &state, snapshot).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "fast receiver error, stopping");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Closes the listener, the fast socket, and every reliable stream.
    /// Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.discovery.stop_advertising().await;
        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for h in handles {
            let _ = h.await;
        }
        // The acceptor/fast-receiver tasks above have exited and dropped their
        // clones; dropping ours too actually closes the listener and socket
        // instead of leaving them bound for the rest of this value's lifetime.
        self.tcp.lock().unwrap().take();
        self.fast.lock().unwrap().take();
    }
}

/// Snapshots `game_state` under the lock (caller already has the snapshot),
/// serializes once, and fires the same datagram at every known fast
/// endpoint. Per-recipient send failures are logged and never abort the
/// broadcast to the rest.
async fn broadcast(fast: &UdpSocket, state: &Arc<Mutex<ServerState>>, snapshot: GameState) {
    let targets: Vec<SocketAddr> = {
        let s = state.lock().await;
        s.client_map.values().copied().collect()
    };
    let Ok(bytes) = encode_to_bytes(&NetMsg::Snapshot(snapshot)) else {
        return;
    };
    for addr in targets {
        if let Err(e) = fast.send_to(&bytes, addr).await {
            let failure = NetError::BroadcastSendFailure { addr, source: e };
            warn!(error = %failure, "broadcast send failed");
        }
    }
}

/// One reliable connection's lifetime: handshake, then a liveness-only read
/// loop until the stream closes or the server is asked to stop.
async fn run_session(
    mut conn: ReliableConn,
    peer: SocketAddr,
    game_id: GameId,
    fast_port: u16,
    state: Arc<Mutex<ServerState>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let hello = conn.recv().await;
    let client_game_id = match hello {
        Ok(NetMsg::Hello { game_id }) => game_id,
        Ok(other) => {
            let _ = conn
                .send(&NetMsg::Disconnect {
                    reason: "expected Hello".to_string(),
                })
                .await;
            return Err(NetError::HandshakeRejected(format!("unexpected first frame: {other:?}")).into());
        }
        Err(e) => return Err(e),
    };

    if client_game_id != game_id {
        let _ = conn
            .send(&NetMsg::Disconnect {
                reason: "game_id mismatch".to_string(),
            })
            .await;
        return Err(NetError::HandshakeRejected(format!(
            "game_id mismatch: expected {game_id}, got {client_game_id}"
        ))
        .into());
    }

    let client_id = ClientId::new_random();
    {
        let mut s = state.lock().await;
        s.sessions.insert(
            client_id,
            SessionInfo {
                connected_at: Instant::now(),
            },
        );
    }
    info!(%client_id, %peer, "handshake complete");

    conn.send(&NetMsg::Welcome {
        client_id,
        fast_port,
    })
    .await?;

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            msg = conn.recv() => {
                match msg {
                    Ok(_) => continue,
                    Err(e) => {
                        let is_decode = e
                            .downcast_ref::<NetError>()
                            .is_some_and(|ne| matches!(ne, NetError::Decode(_)));
                        if is_decode {
                            debug!(error = %e, %peer, "liveness frame failed to decode, session stays up");
                            continue;
                        }
                        break Err(e);
                    }
                }
            }
        }
    };

    {
        let mut s = state.lock().await;
        s.sessions.remove(&client_id);
        s.game_state.remove(&client_id);
        s.client_map.remove(&client_id);
    }
    info!(%client_id, "session ended");

    result
}

/// Binds a [`GameServer`] on an ephemeral loopback port with discovery
/// disabled; used by tests.
pub async fn bind_ephemeral(game_id: GameId) -> anyhow::Result<GameServer> {
    GameServer::bind(
        IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        0,
        game_id,
        Arc::new(NoopDiscovery),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::net::DEFAULT_TCP_PORT;
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    /// Writes a raw length-prefixed frame, bypassing `ReliableConn::send`'s
    /// serialization so a test can put arbitrary (including malformed)
    /// bytes on the wire.
    async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> anyhow::Result<()> {
        stream.write_u32(payload.len() as u32).await?;
        stream.write_all(payload).await?;
        Ok(())
    }

    #[tokio::test]
    async fn handshake_assigns_id_and_fast_port() -> anyhow::Result<()> {
        let server = bind_ephemeral(GameId::new("T")).await?;
        server.start().await?;
        let addr = server.reliable_addr()?;

        let stream = TcpStream::connect(addr).await?;
        let mut conn = ReliableConn::new(stream);
        conn.send(&NetMsg::Hello {
            game_id: GameId::new("T"),
        })
        .await?;

        let welcome = conn.recv().await?;
        let NetMsg::Welcome { fast_port, .. } = welcome else {
            panic!("expected Welcome, got {welcome:?}");
        };
        assert_ne!(fast_port, DEFAULT_TCP_PORT);

        server.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_game_id_is_rejected_without_assigning_id() -> anyhow::Result<()> {
        let server = bind_ephemeral(GameId::new("A")).await?;
        server.start().await?;
        let addr = server.reliable_addr()?;

        let stream = TcpStream::connect(addr).await?;
        let mut conn = ReliableConn::new(stream);
        conn.send(&NetMsg::Hello {
            game_id: GameId::new("B"),
        })
        .await?;

        let reply = conn.recv().await?;
        assert!(matches!(reply, NetMsg::Disconnect { .. }));

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetError>(),
            Some(NetError::Closed)
        ));

        server.stop().await;
        Ok(())
    }

    /// A liveness frame that fails to deserialize must be logged and
    /// skipped, not torn down like `Closed`/`Framing`. See
    /// `ReliableConn::recv`'s documented decode-error policy.
    #[tokio::test]
    async fn decode_error_on_liveness_frame_does_not_tear_down_session() -> anyhow::Result<()> {
        let server = bind_ephemeral(GameId::new("T")).await?;
        server.start().await?;
        let addr = server.reliable_addr()?;

        let mut stream = TcpStream::connect(addr).await?;

        // Handshake over the raw stream (rather than `ReliableConn`, which
        // would take ownership of it) so we keep hold of it for the
        // malformed liveness frame below.
        let hello = serde_json::to_vec(&NetMsg::Hello {
            game_id: GameId::new("T"),
        })?;
        write_frame(&mut stream, &hello).await?;

        let len = stream.read_u32().await?;
        let mut welcome_buf = vec![0u8; len as usize];
        stream.read_exact(&mut welcome_buf).await?;
        let welcome: NetMsg = serde_json::from_slice(&welcome_buf)?;
        assert!(matches!(welcome, NetMsg::Welcome { .. }));

        write_frame(&mut stream, b"not valid json").await?;

        // If the server had torn down the session, this read would observe
        // EOF almost immediately; nothing is ever sent on the liveness
        // channel absent a teardown, so a timeout here means the session
        // (and the stream) are still alive.
        let outcome = tokio::time::timeout(Duration::from_millis(300), stream.read_u8()).await;
        assert!(
            outcome.is_err(),
            "server closed the stream after a malformed liveness frame"
        );

        server.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fast_receive_learns_endpoint_and_broadcasts() -> anyhow::Result<()> {
        let server = bind_ephemeral(GameId::new("T")).await?;
        server.start().await?;
        let addr = server.reliable_addr()?;
        let fast_port = server.fast_port();

        let stream = TcpStream::connect(addr).await?;
        let mut conn = ReliableConn::new(stream);
        conn.send(&NetMsg::Hello {
            game_id: GameId::new("T"),
        })
        .await?;
        let welcome = conn.recv().await?;
        let NetMsg::Welcome { client_id, .. } = welcome else {
            panic!("expected Welcome");
        };

        let client_fast = UnreliableConn::connect(
            "127.0.0.1:0".parse()?,
            SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), fast_port),
        )
        .await?;
        client_fast
            .send(&NetMsg::Update {
                client_id,
                payload: serde_json::json!({"pos": [1, 2]}),
            })
            .await?;

        let snapshot = client_fast
            .recv_timeout(Duration::from_secs(2))
            .await?
            .expect("expected a broadcast snapshot");
        let NetMsg::Snapshot(state) = snapshot else {
            panic!("expected Snapshot");
        };
        assert_eq!(state.get(&client_id), Some(&serde_json::json!({"pos": [1, 2]})));

        server.stop().await;
        Ok(())
    }
}
