//! Signaling messages, per-session channels, and the WebSocket transport

pub mod protocol;
pub mod session;
pub mod websocket;

pub use protocol::{Incoming, IncomingSignalingMessage, OutgoingSignalingMessage};
pub use session::{SessionHandle, SessionTransport};
pub use websocket::SignalingServer;
