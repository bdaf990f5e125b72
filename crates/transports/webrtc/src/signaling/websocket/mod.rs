//! WebSocket signaling transport
//!
//! One WebSocket per session at `/signaling/{id}`, carrying
//! `{"type", "data"}` text frames in both directions.

mod handler;
mod server;

pub use handler::{session_id_from_path, SIGNALING_PATH};
pub use server::SignalingServer;
