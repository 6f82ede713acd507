//! `engine_shared`
//!
//! Primitives shared by the server and client halves of the networking
//! runtime: the framed reliable/unreliable codec, LAN discovery, the
//! handshake/session protocol, configuration, and the `NetSprite` carrier
//! that game-specific sprite classes build on.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (net, discovery, config, sprite).
//! - Traits for abstraction and dependency injection (`DiscoveryService`).
//! - No `unsafe`.

pub mod config;
pub mod discovery;
pub mod error;
pub mod net;
pub mod sprite;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::discovery::*;
    pub use crate::error::*;
    pub use crate::net::*;
    pub use crate::sprite::*;
}
