//! `engine_server`
//!
//! The authoritative side of the session runtime: accepts reliable
//! handshakes, assigns [`engine_shared::net::ClientId`]s, and broadcasts the
//! merged [`engine_shared::net::GameState`] over the unreliable channel.

pub mod server;

pub use server::GameServer;
