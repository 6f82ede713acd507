//! Typed error kinds for the networking runtime.
//!
//! Most call sites propagate failures with `anyhow::Result` and `.context(...)`,
//! matching the rest of this crate's error-handling style. `NetError` exists
//! for the handful of places where callers need to distinguish *which* kind
//! of failure happened (e.g. a session loop deciding whether to tear down).

use thiserror::Error;

/// A networking failure with a specific, matchable kind.
#[derive(Debug, Error)]
pub enum NetError {
    /// The peer closed its end of the stream cleanly (zero-byte read).
    #[error("connection closed by peer")]
    Closed,

    /// A framed message was truncated, or exceeded the maximum frame size.
    #[error("framing error: {0}")]
    Framing(String),

    /// A frame or datagram was read but failed to deserialize.
    #[error("decode error: {0}")]
    Decode(String),

    /// Bind/listen failed during server construction.
    #[error("config error: {0}")]
    ConfigError(String),

    /// The handshake's `game_id` did not match, or the first frame was malformed.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// No well-formed datagram was observed within `DISCONNECT_TIMEOUT`.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// A broadcast send to one recipient failed; does not abort the broadcast.
    #[error("broadcast send to {addr} failed: {source}")]
    BroadcastSendFailure {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
