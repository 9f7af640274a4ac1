//! WebSocket support (RFC 6455).
//!
//! - **`frame`**: wire codec for individual frames
//! - **`handshake`**: upgrade validation and the `101` response
//! - **`connection`**: the per-connection state machine and handler API
//!
//! An HTTP connection hands its stream over to [`WebSocketConnection`]
//! once an upgrade request has been accepted.

pub mod connection;
pub mod frame;
pub mod handshake;

pub use connection::{
    WebSocketConfig, WebSocketConnection, WebSocketHandler, WebSocketSender, WebSocketState,
    WebSocketStats,
};
pub use frame::{Frame, FrameError, Opcode};
pub use handshake::HandshakeError;
