//! `engine_client`
//!
//! The client side of the session runtime: reliable handshake, unreliable
//! state push/pull, and heartbeat-based disconnect detection. See
//! [`client::GameClient`].

pub mod client;

pub use client::GameClient;
