//! WebRTC peer connection wrapper
//!
//! Builds the engine for one session with STUN servers and the two local
//! sample tracks attached, and exposes the negotiation primitives the
//! controller drives.

use crate::config::{StreamCodec, StreamConfig};
use crate::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Stream id shared by both local tracks so browsers group them in one MediaStream
pub const LOCAL_STREAM_ID: &str = "intercom";

/// Capability advertised for a local track of `codec`
pub fn codec_capability(codec: StreamCodec) -> RTCRtpCodecCapability {
    match codec {
        StreamCodec::Opus => RTCRtpCodecCapability {
            mime_type: codec.mime_type().to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        StreamCodec::H264 | StreamCodec::Vp8 | StreamCodec::Vp9 => RTCRtpCodecCapability {
            mime_type: codec.mime_type().to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

/// One session's engine plus its local tracks
pub struct PeerConnection {
    session_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticSample>,
    video_track: Arc<TrackLocalStaticSample>,
    senders: Vec<Arc<RTCRtpSender>>,
}

impl PeerConnection {
    /// Create the engine and attach the audio and video tracks.
    ///
    /// # Errors
    ///
    /// Fails if the engine cannot be built or either track cannot be attached;
    /// nothing is registered for the session in that case.
    #[instrument(skip(config), fields(session_id = %session_id))]
    pub async fn new(session_id: &str, config: &StreamConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .stun_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
            })?);

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            codec_capability(config.audio_source.codec),
            "audio".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        let video_track = Arc::new(TrackLocalStaticSample::new(
            codec_capability(config.video_source.codec),
            "video".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));

        let mut senders = Vec::with_capacity(2);
        for track in [&audio_track, &video_track] {
            let sender = match peer_connection
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => sender,
                Err(e) => {
                    let _ = peer_connection.close().await;
                    return Err(Error::MediaTrackError(format!(
                        "Failed to add {} track: {}",
                        TrackLocal::id(track.as_ref()),
                        e
                    )));
                }
            };
            senders.push(sender);
        }

        info!(
            audio = %config.audio_source.codec,
            video = %config.video_source.codec,
            "Peer connection created with local tracks"
        );

        Ok(Self {
            session_id: session_id.to_string(),
            peer_connection,
            audio_track,
            video_track,
            senders,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Underlying engine, for callback registration
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio_track)
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video_track)
    }

    /// Apply a remote offer and return the local answer once it is set
    pub async fn create_answer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!(session_id = %self.session_id, "Local description set");

        Ok(self
            .peer_connection
            .local_description()
            .await
            .unwrap_or(answer))
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    /// Drain RTCP on the local senders so interceptors (NACK, reports) keep running
    pub fn spawn_rtcp_readers(&self, cancel: &CancellationToken) {
        for sender in &self.senders {
            let sender = Arc::clone(sender);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        read = sender.read(&mut rtcp_buf) => {
                            if read.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close: {}", e)))
    }
}
