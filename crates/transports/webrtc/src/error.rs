//! Error types for the intercom WebRTC transport

use crate::media::{MediaKind, PipelineState};

/// Result type alias using the transport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in signaling, peer, and pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling channel error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Signaling payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A session id was registered twice
    #[error("Peer {0} is already registered")]
    DuplicatePeer(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Local or remote media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Media pipeline construction or stream error
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// A capture pipeline refused a play/stop transition
    #[error("{kind} pipeline failed to reach {target}: {reason}")]
    PipelineStateError {
        kind: MediaKind,
        target: PipelineState,
        reason: String,
    },

    /// Inbound sink pipeline error
    #[error("Sink error: {0}")]
    SinkError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error must bring the process down.
    ///
    /// Only capture pipeline state transitions qualify: the device or encoder
    /// behind them cannot be recovered at runtime.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::PipelineStateError { .. })
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error only affects a single peer
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicatePeer(_)
                | Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::MediaTrackError(_)
                | Error::SinkError(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtcError(e.to_string())
    }
}
