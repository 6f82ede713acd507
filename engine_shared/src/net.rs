//! Networking primitives.
//!
//! Two wire shapes:
//! - Reliable channel (TCP): 4-byte big-endian length prefix, then that many
//!   bytes of a JSON-encoded [`NetMsg`]. Used for the handshake and for
//!   liveness — no application messages flow over it after `Welcome`.
//! - Unreliable channel (UDP): one JSON-encoded [`NetMsg`] per datagram, no
//!   framing, capped at [`UDP_BUFFER_SIZE`].
//!
//! `Payload` is intentionally opaque: the framework never interprets it, it
//! only routes it from one client's `send_update` to every other client's
//! `get_latest_state`.

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, net::SocketAddr};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};
use uuid::Uuid;

use crate::error::NetError;

/// Protocol version for compatibility checks between endpoints.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default reliable-channel listen port.
pub const DEFAULT_TCP_PORT: u16 = 12345;

/// Maximum size of a single reliable frame's payload. Frames larger than
/// this are a fatal framing error rather than an allocation hazard.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Receive buffer size for the unreliable channel; senders must not exceed it.
pub const UDP_BUFFER_SIZE: usize = 4096;

/// Opaque, application-defined per-client state. The core never interprets
/// this beyond routing it; `None`/absent means "nothing to send this frame".
pub type Payload = serde_json::Value;

/// Server-authoritative mapping of every known client to its most recent payload.
pub type GameState = HashMap<ClientId, Payload>;

/// Opaque short string identifying a game variant. Two endpoints with
/// different `GameId`s must refuse to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameId(pub String);

impl GameId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GameId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Server-minted unique identifier for a connected client. 128-bit random,
/// rendered as a stable string; immutable for the lifetime of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Mints a fresh, process-wide-unique client identity.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handshake / session control envelope exchanged over the reliable channel,
/// plus the unreliable-channel payload wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    /// Client -> server, first frame of the handshake.
    Hello { game_id: GameId },
    /// Server -> client, second frame: assigns identity and the fast port.
    Welcome { client_id: ClientId, fast_port: u16 },
    /// Server -> client: graceful disconnect notice.
    Disconnect { reason: String },

    /// Client -> server, unreliable channel: per-frame local state.
    Update { client_id: ClientId, payload: Payload },
    /// Server -> client, unreliable channel: aggregated world state.
    Snapshot(GameState),
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize msg")?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(NetError::Framing(format!(
                "encoded frame of {} bytes exceeds MAX_FRAME_BYTES",
                payload.len()
            ))
            .into());
        }
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        self.stream
            .write_all(&buf)
            .await
            .map_err(|_| NetError::Closed)?;
        Ok(())
    }

    /// Reads exactly one framed [`NetMsg`]. Returns [`NetError::Closed`] on a
    /// clean peer shutdown and [`NetError::Framing`] on a truncated or
    /// oversized frame; a successfully-read-but-unparseable frame is
    /// [`NetError::Decode`] and does not tear down the connection.
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        let mut len_buf = [0u8; 4];
        self.read_exact_or_closed(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(NetError::Framing(format!(
                "frame length {len} exceeds MAX_FRAME_BYTES"
            ))
            .into());
        }

        let mut payload = vec![0u8; len];
        self.read_exact_or_closed(&mut payload).await?;

        serde_json::from_slice(&payload)
            .map_err(|e| NetError::Decode(e.to_string()).into())
    }

    /// Loops until exactly `buf.len()` bytes are read or the stream closes.
    async fn read_exact_or_closed(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(_) => Err(NetError::Closed.into()),
        }
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Half-closes the write side. Tolerates a peer that already hung up.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize udp msg")?;
        self.socket.send(&payload).await.context("udp send")?;
        Ok(())
    }

    pub async fn recv(&self) -> anyhow::Result<NetMsg> {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        let n = self.socket.recv(&mut buf).await.context("udp recv")?;
        decode_from_bytes(&buf[..n])
    }

    /// Receives a datagram within the given timeout. `Ok(None)` on timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => Ok(Some(decode_from_bytes(&buf[..n])?)),
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetError::ConfigError(e.to_string()))?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers shared by the UDP path and tests.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<bytes::Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(bytes::Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).map_err(|e| NetError::Decode(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netmsg_roundtrip_bytes() {
        let msg = NetMsg::Hello {
            game_id: GameId::new("T"),
        };
        let bytes = encode_to_bytes(&msg).unwrap();
        let back = decode_from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn client_id_is_unique_across_many_calls() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(ClientId::new_random()));
        }
    }

    #[test]
    fn decode_malformed_bytes_is_decode_error_not_panic() {
        let err = decode_from_bytes(b"not json").unwrap_err();
        assert!(err.downcast_ref::<NetError>().is_some());
    }

    #[tokio::test]
    async fn reliable_conn_roundtrips_a_frame() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;

        let (accepted, stream) = tokio::try_join!(
            async { listener.accept().await },
            async { TcpStream::connect(addr).await.map_err(anyhow::Error::from) }
        )?;
        let (mut server_side, _) = accepted;
        let mut client_side = ReliableConn::new(stream);

        let msg = NetMsg::Welcome {
            client_id: ClientId::new_random(),
            fast_port: 40000,
        };
        client_side.send(&msg).await?;
        let got = server_side.recv().await?;
        assert_eq!(got, msg);
        Ok(())
    }
}
