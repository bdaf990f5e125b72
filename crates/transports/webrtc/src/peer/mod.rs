//! Peer connections, their negotiation driver, and the peer registry

pub mod connection;
pub mod controller;
pub mod inbound;
pub mod registry;

pub use connection::PeerConnection;
pub use controller::PeerController;
pub use inbound::accepts_track;
pub use registry::{PeerRegistry, PeerState, Removal};
