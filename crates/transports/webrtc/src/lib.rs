//! WebRTC intercom core
//!
//! Accepts browser peers over WebSocket signaling, answers their offers, and
//! streams one shared pair of capture pipelines (audio + video) to every
//! connected peer. Inbound peer audio is relayed into a local sink.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Browser peers                                           │
//! │  ↓ WebSocket /signaling/{id}                             │
//! │  SignalingServer  → SessionHandle per connection         │
//! │  ↓                                                       │
//! │  WebrtcHandler (lifecycle coordinator)                   │
//! │  ├─ PeerController per session (offer/answer, ICE)       │
//! │  │   └─ inbound track → SinkPipeline                     │
//! │  ├─ PeerRegistry (session id → local tracks, scope)      │
//! │  └─ MediaPipelines (audio, video)                        │
//! │      └─ fan-out relay → every registered peer's track    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use intercom_webrtc::config::StreamConfig;
//!
//! let config = StreamConfig::default().with_stun_servers(Vec::new());
//! assert!(config.validate().is_ok());
//! assert_eq!(config.sample_buffer, 100);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use intercom_webrtc::config::StreamConfig;
//! use intercom_webrtc::{SignalingServer, WebrtcHandler};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> intercom_webrtc::Result<()> {
//! let config = StreamConfig::default();
//! let shutdown = CancellationToken::new();
//! let (session_tx, session_rx) = mpsc::channel(16);
//!
//! let server = SignalingServer::bind("0.0.0.0:8080", config.session_buffer).await?;
//! server.serve(session_tx, shutdown.clone());
//!
//! let mut handle = WebrtcHandler::new(config)?.start(session_rx, shutdown)?;
//! if let Some(err) = handle.fatal().await {
//!     eprintln!("pipeline failure: {}", err);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod handler;
pub mod media;
pub mod peer;
pub mod signaling;

pub use config::{ServerConfig, StreamCodec, StreamConfig};
pub use error::{Error, Result};
pub use handler::{MediaPipelines, WebrtcHandle, WebrtcHandler};
pub use media::{MediaKind, MediaPipeline, PipelineState};
pub use peer::{PeerRegistry, PeerState};
pub use signaling::{
    IncomingSignalingMessage, OutgoingSignalingMessage, SessionHandle, SignalingServer,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
