//! LAN host discovery.
//!
//! A `DiscoveryService` lets a host advertise `{game_id, host_name, port}`
//! and lets a client scan for matching hosts. `NetworkScene` never depends
//! on a specific variant — only [`LanDiscovery`] is provided here, but
//! alternative transports (e.g. a short-range radio beacon) can implement
//! the same trait.

use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, warn};

use crate::net::GameId;

/// How often a host re-announces itself while advertising.
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);
/// Well-known port discovery broadcasts are sent to and scanned on.
pub const BROADCAST_PORT: u16 = 12346;
/// Default scan duration when the caller doesn't specify one.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// A discovered host, as reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub name: String,
    pub ip: std::net::IpAddr,
    pub reliable_port: u16,
    pub game_id: GameId,
}

/// Wire payload broadcast by an advertising host.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Announcement {
    game_id: GameId,
    host_name: String,
    tcp_port: u16,
}

/// Pluggable host-discovery mechanism.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    /// Begins periodic announcements. Idempotent: calling this while already
    /// advertising is a no-op rather than spawning a second announcer.
    async fn start_advertising(&self, game_id: GameId, reliable_port: u16) -> anyhow::Result<()>;

    /// Stops advertising. Must not fail if never started.
    async fn stop_advertising(&self);

    /// Scans for up to `timeout`, returning all distinct hosts (deduplicated
    /// by `(ip, reliable_port)`) whose announcements matched `game_id`.
    async fn find(&self, game_id: &GameId, timeout: Duration) -> anyhow::Result<Vec<HostInfo>>;
}

/// LAN broadcast discovery: advertise via periodic UDP broadcasts to
/// [`BROADCAST_PORT`]; find by binding that port and listening.
pub struct LanDiscovery {
    advertising: Arc<AtomicBool>,
}

impl Default for LanDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl LanDiscovery {
    pub fn new() -> Self {
        Self {
            advertising: Arc::new(AtomicBool::new(false)),
        }
    }

    fn broadcast_socket() -> anyhow::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Binds the well-known discovery port for scanning. A bind conflict
    /// (another process already holding it) is logged and non-fatal: the
    /// caller falls back to an ephemeral port and simply won't see
    /// broadcasts sent strictly to `BROADCAST_PORT` from this host, though
    /// it can still observe others.
    fn scan_socket() -> anyhow::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        match socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, BROADCAST_PORT).into()) {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, port = BROADCAST_PORT, "discovery port bind conflict, scanning with ephemeral port instead");
                socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
            }
        }
        Ok(UdpSocket::from_std(socket.into())?)
    }
}

#[async_trait]
impl DiscoveryService for LanDiscovery {
    async fn start_advertising(&self, game_id: GameId, reliable_port: u16) -> anyhow::Result<()> {
        if self.advertising.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let socket = match Self::broadcast_socket() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to open broadcast socket; advertising disabled");
                self.advertising.store(false, Ordering::SeqCst);
                return Ok(());
            }
        };
        let flag = Arc::clone(&self.advertising);
        let host_name = hostname();

        tokio::spawn(async move {
            let announcement = Announcement {
                game_id,
                host_name,
                tcp_port: reliable_port,
            };
            let dest = SocketAddr::new(Ipv4Addr::BROADCAST.into(), BROADCAST_PORT);
            while flag.load(Ordering::SeqCst) {
                if let Ok(bytes) = serde_json::to_vec(&announcement) {
                    if let Err(e) = socket.send_to(&bytes, dest).await {
                        debug!(error = %e, "broadcast send failed");
                    }
                }
                time::sleep(BROADCAST_INTERVAL).await;
            }
        });

        Ok(())
    }

    async fn stop_advertising(&self) {
        self.advertising.store(false, Ordering::SeqCst);
    }

    async fn find(&self, game_id: &GameId, timeout: Duration) -> anyhow::Result<Vec<HostInfo>> {
        let socket = Self::scan_socket()?;
        let mut seen = HashSet::new();
        let mut hosts = Vec::new();
        let deadline = time::Instant::now() + timeout;
        let mut buf = vec![0u8; crate::net::UDP_BUFFER_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match time::timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    let Ok(announcement) = serde_json::from_slice::<Announcement>(&buf[..n])
                    else {
                        continue;
                    };
                    if announcement.game_id != *game_id {
                        continue;
                    }
                    let key = (from.ip(), announcement.tcp_port);
                    if seen.insert(key) {
                        hosts.push(HostInfo {
                            name: announcement.host_name,
                            ip: from.ip(),
                            reliable_port: announcement.tcp_port,
                            game_id: announcement.game_id,
                        });
                    }
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "discovery scan recv error");
                }
                Err(_) => break,
            }
        }

        Ok(hosts)
    }
}

/// A [`DiscoveryService`] that does nothing. Used when `discovery_enabled`
/// is off in [`crate::config::EngineConfig`], and by tests that don't want
/// real broadcast traffic on the loopback interface.
#[derive(Debug, Default)]
pub struct NoopDiscovery;

#[async_trait]
impl DiscoveryService for NoopDiscovery {
    async fn start_advertising(&self, _game_id: GameId, _reliable_port: u16) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop_advertising(&self) {}

    async fn find(&self, _game_id: &GameId, _timeout: Duration) -> anyhow::Result<Vec<HostInfo>> {
        Ok(Vec::new())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}
