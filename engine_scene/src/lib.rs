//! `engine_scene`
//!
//! The seam between a synchronous per-frame game loop and the async
//! client/server runtime. A game only ever touches [`GameLogic`] and
//! [`NetworkScene`]; it never calls `engine_client`/`engine_server`
//! directly.

pub mod scene;

pub use scene::{ClientScene, GameLogic, HostScene, NetworkScene, ID_WAIT_INTERVAL, ID_WAIT_TIMEOUT};
