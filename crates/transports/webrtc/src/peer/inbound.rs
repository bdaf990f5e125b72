//! Inbound remote track relay
//!
//! An accepted remote track gets two tasks scoped to the peer: a periodic
//! picture loss indication and a read loop feeding a local sink pipeline.

use crate::config::StreamCodec;
use crate::media::SinkFactory;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_remote::TrackRemote;

/// Everything the inbound relay needs from its peer
#[derive(Clone)]
pub struct InboundContext {
    pub session_id: String,

    /// Codec an inbound track must carry to be relayed
    pub expected: StreamCodec,

    pub pli_interval: Duration,
    pub read_buffer_size: usize,
    pub sinks: Arc<dyn SinkFactory>,

    /// Held weakly so the engine's own callback does not keep it alive
    pub peer_connection: Weak<RTCPeerConnection>,

    pub cancel: CancellationToken,
}

/// Whether a remote track negotiated with `mime_type` can be relayed
pub fn accepts_track(expected: StreamCodec, mime_type: &str) -> bool {
    expected.matches_mime(mime_type)
}

/// Error kinds that mean the remote track or the transport is gone for good
fn is_end_of_stream(err: &webrtc::Error) -> bool {
    matches!(
        err,
        webrtc::Error::ErrClosedPipe | webrtc::Error::ErrConnectionClosed
    ) || err.to_string().contains("EOF")
}

/// Start relaying a remote track.
///
/// Returns without waiting: the engine holds a lock while this runs, so the
/// work is spawned. Tracks with an unexpected codec are dropped and no sink is
/// created for them.
pub fn handle_remote_track(ctx: InboundContext, track: Arc<TrackRemote>) {
    let mime_type = track.codec().capability.mime_type;
    let ssrc = track.ssrc();

    if !accepts_track(ctx.expected, &mime_type) {
        warn!(
            session_id = %ctx.session_id,
            codec = %mime_type,
            expected = %ctx.expected,
            "Dropping remote track with unexpected codec"
        );
        return;
    }

    let mut sink = match ctx.sinks.create(&ctx.session_id, ctx.expected) {
        Ok(sink) => sink,
        Err(e) => {
            warn!(session_id = %ctx.session_id, error = %e, "No sink for remote track");
            return;
        }
    };

    info!(session_id = %ctx.session_id, codec = %mime_type, ssrc, "Relaying remote track");

    spawn_pli_ticker(&ctx, ssrc);

    let session_id = ctx.session_id.clone();
    let cancel = ctx.cancel.clone();
    let buffer_size = ctx.read_buffer_size;
    tokio::spawn(async move {
        if let Err(e) = sink.start() {
            warn!(session_id = %session_id, error = %e, "Sink failed to start");
            return;
        }

        let mut buf = vec![0u8; buffer_size];
        let mut relayed: u64 = 0;
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = track.read(&mut buf) => read,
            };

            match read {
                Ok((packet, _)) => {
                    if let Err(e) = sink.push(&packet) {
                        debug!(session_id = %session_id, error = %e, "Sink rejected packet");
                    } else {
                        relayed += 1;
                    }
                }
                Err(e) if is_end_of_stream(&e) => {
                    debug!(session_id = %session_id, "Remote track ended");
                    break;
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Remote track read failed");
                }
            }
        }

        if let Err(e) = sink.stop() {
            warn!(session_id = %session_id, error = %e, "Sink failed to stop cleanly");
        }
        info!(session_id = %session_id, packets = relayed, "Inbound relay stopped");
    });
}

/// Request a keyframe every `pli_interval` until the peer scope is cancelled,
/// the engine is dropped, or the transport reports it is closed.
fn spawn_pli_ticker(ctx: &InboundContext, media_ssrc: u32) -> JoinHandle<()> {
    let session_id = ctx.session_id.clone();
    let cancel = ctx.cancel.clone();
    let peer_connection = ctx.peer_connection.clone();
    let period = ctx.pli_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(pc) = peer_connection.upgrade() else {
                break;
            };
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            match pc.write_rtcp(&[Box::new(pli)]).await {
                Ok(_) => {}
                Err(e) if is_end_of_stream(&e) => break,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to send picture loss indication");
                }
            }
        }
        debug!(session_id = %session_id, "Keyframe ticker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioSinkConfig;
    use crate::media::TargetSinkFactory;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    async fn engine() -> Arc<RTCPeerConnection> {
        let api = APIBuilder::new().build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }

    fn context(peer_connection: Weak<RTCPeerConnection>) -> InboundContext {
        InboundContext {
            session_id: "peer-1".to_string(),
            expected: StreamCodec::Opus,
            pli_interval: Duration::from_millis(10),
            read_buffer_size: 1400,
            sinks: Arc::new(TargetSinkFactory::new(AudioSinkConfig::default()).unwrap()),
            peer_connection,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_accepts_only_expected_codec() {
        assert!(accepts_track(StreamCodec::Opus, "audio/opus"));
        assert!(accepts_track(StreamCodec::Opus, "audio/OPUS"));
        assert!(!accepts_track(StreamCodec::Opus, "audio/PCMA"));
        assert!(!accepts_track(StreamCodec::Opus, "video/VP8"));
    }

    #[test]
    fn test_end_of_stream_errors() {
        assert!(is_end_of_stream(&webrtc::Error::ErrClosedPipe));
        assert!(is_end_of_stream(&webrtc::Error::ErrConnectionClosed));
        assert!(!is_end_of_stream(&webrtc::Error::ErrNoRemoteDescription));
    }

    #[tokio::test]
    async fn test_pli_ticker_stops_when_engine_is_dropped() {
        let pc = engine().await;
        let ctx = context(Arc::downgrade(&pc));
        pc.close().await.unwrap();
        drop(pc);

        let ticker = spawn_pli_ticker(&ctx, 1234);
        tokio::time::timeout(Duration::from_secs(2), ticker)
            .await
            .expect("ticker kept running without an engine")
            .unwrap();
    }

    #[tokio::test]
    async fn test_pli_ticker_stops_on_cancel() {
        let pc = engine().await;
        let ctx = context(Arc::downgrade(&pc));

        let ticker = spawn_pli_ticker(&ctx, 1234);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ticker.is_finished());

        ctx.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), ticker)
            .await
            .expect("ticker ignored cancellation")
            .unwrap();

        pc.close().await.unwrap();
    }
}
