//! Per-session negotiation driver
//!
//! Owns one [`PeerConnection`], wires its engine callbacks, and runs the
//! signaling loop until the session's inbound sequence ends or its
//! cancellation scope fires.

use super::connection::PeerConnection;
use super::inbound::{handle_remote_track, InboundContext};
use super::registry::PeerState;
use crate::config::StreamConfig;
use crate::media::track::SharedWriter;
use crate::media::SinkFactory;
use crate::signaling::protocol::{Incoming, IncomingSignalingMessage, OutgoingSignalingMessage};
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Holds local candidates back until the answer has been queued, so the
/// remote side never sees a candidate before the description it belongs to.
struct CandidateGate {
    session_id: String,
    pending: Mutex<Option<Vec<RTCIceCandidateInit>>>,
    outbound: mpsc::Sender<OutgoingSignalingMessage>,
}

impl CandidateGate {
    fn new(session_id: &str, outbound: mpsc::Sender<OutgoingSignalingMessage>) -> Self {
        Self {
            session_id: session_id.to_string(),
            pending: Mutex::new(Some(Vec::new())),
            outbound,
        }
    }

    async fn push(&self, candidate: RTCIceCandidateInit) {
        let ready = match self.pending.lock().as_mut() {
            Some(buffered) => {
                buffered.push(candidate);
                None
            }
            None => Some(candidate),
        };

        if let Some(candidate) = ready {
            self.send(candidate).await;
        }
    }

    /// Release buffered candidates; later ones go out immediately
    async fn open(&self) {
        let buffered = self.pending.lock().take().unwrap_or_default();
        if !buffered.is_empty() {
            debug!(session_id = %self.session_id, count = buffered.len(), "Flushing buffered candidates");
        }
        for candidate in buffered {
            self.send(candidate).await;
        }
    }

    async fn send(&self, candidate: RTCIceCandidateInit) {
        if self
            .outbound
            .send(OutgoingSignalingMessage::ice_candidate(candidate))
            .await
            .is_err()
        {
            debug!(session_id = %self.session_id, "Outbound closed, dropping local candidate");
        }
    }
}

/// Negotiation driver for one signaling session
pub struct PeerController {
    session_id: String,
    connection: Arc<PeerConnection>,
    outbound: mpsc::Sender<OutgoingSignalingMessage>,
    candidates: Arc<CandidateGate>,
    cancel: CancellationToken,
}

impl PeerController {
    /// Build the engine and its local tracks and register the engine callbacks.
    ///
    /// `cancel` is this peer's scope. It is cancelled when ICE reports the
    /// connection disconnected or failed, which ends [`PeerController::run`].
    pub async fn create(
        session_id: &str,
        config: &StreamConfig,
        sinks: Arc<dyn SinkFactory>,
        outbound: mpsc::Sender<OutgoingSignalingMessage>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let connection = Arc::new(PeerConnection::new(session_id, config).await?);
        let candidates = Arc::new(CandidateGate::new(session_id, outbound.clone()));
        let pc = connection.inner();

        let gate = Arc::clone(&candidates);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => gate.push(init).await,
                    Err(e) => warn!(session_id = %gate.session_id, error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let state_id = session_id.to_string();
        let state_cancel = cancel.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            match state {
                RTCIceConnectionState::Connected => {
                    info!(session_id = %state_id, "ICE connected");
                }
                RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => {
                    info!(session_id = %state_id, state = %state, "ICE connection lost");
                    state_cancel.cancel();
                }
                other => {
                    debug!(session_id = %state_id, state = %other, "ICE connection state changed");
                }
            }
            Box::pin(async {})
        }));

        let inbound = InboundContext {
            session_id: session_id.to_string(),
            expected: config.audio_sink.codec,
            pli_interval: config.pli_interval(),
            read_buffer_size: config.read_buffer_size,
            sinks,
            peer_connection: Arc::downgrade(pc),
            cancel: cancel.clone(),
        };
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            handle_remote_track(inbound.clone(), track);
            Box::pin(async {})
        }));

        connection.spawn_rtcp_readers(&cancel);

        Ok(Self {
            session_id: session_id.to_string(),
            connection,
            outbound,
            candidates,
            cancel,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection(&self) -> &Arc<PeerConnection> {
        &self.connection
    }

    /// Registry entry for this session
    pub fn peer_state(&self) -> PeerState {
        let audio: SharedWriter = self.connection.audio_track();
        let video: SharedWriter = self.connection.video_track();
        PeerState {
            audio,
            video,
            cancel: self.cancel.clone(),
        }
    }

    /// Process signaling messages until the inbound sequence ends or the
    /// peer's scope is cancelled. Failures are logged per message.
    pub async fn run(&self, mut inbound: mpsc::Receiver<IncomingSignalingMessage>) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(session_id = %self.session_id, "Peer scope cancelled");
                    break;
                }
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => {
                        info!(session_id = %self.session_id, "Signaling closed");
                        break;
                    }
                },
            };

            if let Err(e) = self.handle_message(message).await {
                warn!(session_id = %self.session_id, error = %e, "Failed to handle signaling message");
            }
        }
    }

    async fn handle_message(&self, message: IncomingSignalingMessage) -> Result<()> {
        match message.decode()? {
            Incoming::Offer(offer) => self.handle_offer(offer).await,
            Incoming::IceCandidate(candidate) => {
                debug!(session_id = %self.session_id, "Adding remote candidate");
                self.connection.add_ice_candidate(candidate).await
            }
            Incoming::Answer(_) => {
                debug!(session_id = %self.session_id, "Ignoring answer, this side only answers");
                Ok(())
            }
            Incoming::Unrecognized(kind) => {
                debug!(session_id = %self.session_id, kind = %kind, "Ignoring unrecognized signaling message");
                Ok(())
            }
        }
    }

    async fn handle_offer(&self, offer: RTCSessionDescription) -> Result<()> {
        info!(session_id = %self.session_id, "Received offer");
        let answer = self.connection.create_answer(offer).await?;

        if self
            .outbound
            .send(OutgoingSignalingMessage::answer(answer))
            .await
            .is_err()
        {
            debug!(session_id = %self.session_id, "Outbound closed before answer was sent");
            return Ok(());
        }
        info!(session_id = %self.session_id, "Sent answer");

        self.candidates.open().await;
        Ok(())
    }

    /// Cancel the peer's scope and close the engine
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.connection.close().await {
            warn!(session_id = %self.session_id, error = %e, "Failed to close peer connection");
        }
    }
}
