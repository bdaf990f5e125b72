//! Signaling message types
//!
//! Wire shape: `{"type": "offer" | "answer" | "new-ice-candidate", "data": <payload>}`.
//! Incoming payloads stay raw until the tag is known; outgoing messages are
//! fully built before they are queued.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Tag of an SDP offer
pub const OFFER: &str = "offer";

/// Tag of an SDP answer
pub const ANSWER: &str = "answer";

/// Tag of a trickled ICE candidate
pub const ICE_CANDIDATE: &str = "new-ice-candidate";

/// Envelope as received from the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingSignalingMessage {
    /// Message tag
    #[serde(rename = "type")]
    pub kind: String,

    /// Undecoded payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

/// Decoded incoming message
#[derive(Debug, Clone)]
pub enum Incoming {
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    IceCandidate(RTCIceCandidateInit),
    /// Tag outside the protocol; the payload is never parsed
    Unrecognized(String),
}

impl IncomingSignalingMessage {
    /// Parse the envelope of a text frame, leaving `data` raw
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Build an envelope around a serializable payload
    pub fn new<T: Serialize>(kind: &str, data: &T) -> Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            data: Some(serde_json::value::to_raw_value(data)?),
        })
    }

    /// Decode the payload according to the tag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationError`] when a recognized tag carries a
    /// missing or malformed payload. Unrecognized tags never fail.
    pub fn decode(&self) -> Result<Incoming> {
        match self.kind.as_str() {
            OFFER => Ok(Incoming::Offer(self.payload()?)),
            ANSWER => Ok(Incoming::Answer(self.payload()?)),
            ICE_CANDIDATE => Ok(Incoming::IceCandidate(self.payload()?)),
            other => Ok(Incoming::Unrecognized(other.to_string())),
        }
    }

    fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        let raw = self.data.as_ref().ok_or_else(|| {
            Error::SerializationError(format!("{} message without data", self.kind))
        })?;
        serde_json::from_str(raw.get()).map_err(|e| {
            Error::SerializationError(format!("invalid {} payload: {}", self.kind, e))
        })
    }
}

/// Message queued on a session's outbound channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OutgoingSignalingMessage {
    #[serde(rename = "offer")]
    Offer(RTCSessionDescription),

    #[serde(rename = "answer")]
    Answer(RTCSessionDescription),

    #[serde(rename = "new-ice-candidate")]
    IceCandidate(RTCIceCandidateInit),
}

impl OutgoingSignalingMessage {
    pub fn offer(description: RTCSessionDescription) -> Self {
        OutgoingSignalingMessage::Offer(description)
    }

    pub fn answer(description: RTCSessionDescription) -> Self {
        OutgoingSignalingMessage::Answer(description)
    }

    pub fn ice_candidate(candidate: RTCIceCandidateInit) -> Self {
        OutgoingSignalingMessage::IceCandidate(candidate)
    }

    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingSignalingMessage::Offer(_) => OFFER,
            OutgoingSignalingMessage::Answer(_) => ANSWER,
            OutgoingSignalingMessage::IceCandidate(_) => ICE_CANDIDATE,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
