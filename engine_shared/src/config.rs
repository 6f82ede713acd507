//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files (file IO left to app).

use serde::{Deserialize, Serialize};

use crate::net::GameId;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server bind IP (server) or host to connect to (client).
    pub host: String,
    /// Reliable (TCP) port. See `net::ReliableListener`.
    #[serde(default = "default_reliable_port")]
    pub reliable_port: u16,
    /// Identifies this game variant; mismatched ids refuse to connect.
    #[serde(default = "default_game_id")]
    pub game_id: GameId,
    /// Whether to run LAN discovery (advertise on the server, scan on the client).
    #[serde(default = "default_discovery_enabled")]
    pub discovery_enabled: bool,
}

fn default_reliable_port() -> u16 {
    crate::net::DEFAULT_TCP_PORT
}

fn default_game_id() -> GameId {
    GameId::new("default-game")
}

fn default_discovery_enabled() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            reliable_port: default_reliable_port(),
            game_id: default_game_id(),
            discovery_enabled: default_discovery_enabled(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.reliable_port)
    }
}
