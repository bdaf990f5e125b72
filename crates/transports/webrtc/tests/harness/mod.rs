//! Shared fixtures for coordinator and signaling integration tests
//!
//! Provides counting pipeline backends, discarding and counting sink
//! factories, a browser-side peer that produces real offers and can send
//! audio, and polling helpers.

#![allow(dead_code)]

use intercom_webrtc::config::{StreamCodec, StreamConfig};
use intercom_webrtc::media::{NullSink, PipelineBackend, PipelineController, SinkFactory, SinkPipeline};
use intercom_webrtc::signaling::OutgoingSignalingMessage;
use intercom_webrtc::{Error, MediaKind, MediaPipelines, PipelineState, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Initialize tracing for tests (call once per test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,intercom_webrtc=debug,webrtc=warn")
        .try_init();
}

/// Stream config that never reaches the network for STUN
pub fn offline_config() -> StreamConfig {
    StreamConfig::default().with_stun_servers(Vec::new())
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Transition counters shared between a backend and the test
#[derive(Clone, Default)]
pub struct Counters {
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    pub fail: Arc<AtomicBool>,
}

impl Counters {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

/// Backend standing in for a capture device
pub struct CountingBackend {
    state: PipelineState,
    counters: Counters,
}

impl PipelineBackend for CountingBackend {
    fn state(&self) -> PipelineState {
        self.state
    }

    fn set_state(&mut self, target: PipelineState) -> Result<()> {
        if self.counters.fail.load(Ordering::SeqCst) {
            return Err(Error::PipelineError("capture device vanished".to_string()));
        }
        match target {
            PipelineState::Playing => self.counters.starts.fetch_add(1, Ordering::SeqCst),
            PipelineState::Null => self.counters.stops.fetch_add(1, Ordering::SeqCst),
        };
        self.state = target;
        Ok(())
    }
}

/// One counted pipeline plus the sender feeding its sample queue
pub struct TestPipeline {
    pub controller: Arc<PipelineController>,
    pub counters: Counters,
    pub samples: mpsc::Sender<Sample>,
}

impl TestPipeline {
    pub fn new(kind: MediaKind) -> Self {
        let counters = Counters::default();
        let (samples, rx) = mpsc::channel(16);
        let backend = CountingBackend {
            state: PipelineState::Null,
            counters: counters.clone(),
        };
        Self {
            controller: Arc::new(PipelineController::new(kind, Box::new(backend), rx)),
            counters,
            samples,
        }
    }
}

/// Audio and video test pipelines
pub struct TestMedia {
    pub audio: TestPipeline,
    pub video: TestPipeline,
}

impl TestMedia {
    pub fn new() -> Self {
        Self {
            audio: TestPipeline::new(MediaKind::Audio),
            video: TestPipeline::new(MediaKind::Video),
        }
    }

    pub fn pipelines(&self) -> MediaPipelines {
        MediaPipelines::new(
            self.audio.controller.clone(),
            self.video.controller.clone(),
        )
    }
}

/// Sink factory that discards inbound audio
pub struct DiscardSinks;

impl SinkFactory for DiscardSinks {
    fn create(&self, session_id: &str, _codec: StreamCodec) -> Result<Box<dyn SinkPipeline>> {
        Ok(Box::new(NullSink::new(session_id)))
    }
}

/// Sink lifecycle counters shared between a [`CountingSinks`] factory and the test
#[derive(Clone, Default)]
pub struct SinkCounters {
    pub created: Arc<AtomicUsize>,
    pub started: Arc<AtomicUsize>,
    pub pushed: Arc<AtomicUsize>,
    pub stopped: Arc<AtomicUsize>,
    pub codecs: Arc<Mutex<Vec<StreamCodec>>>,
}

impl SinkCounters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn pushed(&self) -> usize {
        self.pushed.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Sink factory that counts every sink it hands out and what they see
#[derive(Default)]
pub struct CountingSinks {
    pub counters: SinkCounters,
}

impl SinkFactory for CountingSinks {
    fn create(&self, _session_id: &str, codec: StreamCodec) -> Result<Box<dyn SinkPipeline>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        self.counters.codecs.lock().push(codec);
        Ok(Box::new(CountingSink {
            counters: self.counters.clone(),
        }))
    }
}

struct CountingSink {
    counters: SinkCounters,
}

impl SinkPipeline for CountingSink {
    fn start(&mut self) -> Result<()> {
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn push(&mut self, _packet: &Packet) -> Result<()> {
        self.counters.pushed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.counters.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Capability a browser track of `mime_type` is sent with
fn browser_capability(mime_type: &str) -> RTCRtpCodecCapability {
    if mime_type.eq_ignore_ascii_case("audio/opus") {
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        }
    } else {
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: 8000,
            ..Default::default()
        }
    }
}

/// Browser-side peer that receives audio and video, and optionally sends
/// audio tracks of its own
pub struct BrowserPeer {
    pub pc: Arc<RTCPeerConnection>,
    tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl BrowserPeer {
    pub async fn new() -> Self {
        let pc = Self::engine().await;
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .unwrap();
        }

        Self {
            pc,
            tracks: Vec::new(),
        }
    }

    /// Peer that sends one audio track per entry of `mime_types`, in order
    pub async fn sending(mime_types: &[&str]) -> Self {
        let pc = Self::engine().await;
        let mut tracks = Vec::with_capacity(mime_types.len());
        for (i, mime_type) in mime_types.iter().enumerate() {
            let track = Arc::new(TrackLocalStaticSample::new(
                browser_capability(mime_type),
                format!("mic-{}", i),
                format!("browser-{}", i),
            ));
            pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .unwrap();
            tracks.push(track);
        }

        Self { pc, tracks }
    }

    async fn engine() -> Arc<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let registry = register_default_interceptors(Default::default(), &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }
    /// Create an offer and apply it locally
    pub async fn offer(&self) -> RTCSessionDescription {
        let offer = self.pc.create_offer(None).await.unwrap();
        self.pc.set_local_description(offer.clone()).await.unwrap();
        offer
    }

    /// Create an offer, apply it locally and wait for candidate gathering so
    /// the returned description carries the local candidates
    pub async fn gathered_offer(&self) -> RTCSessionDescription {
        let offer = self.pc.create_offer(None).await.unwrap();
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await.unwrap();
        let _ = gathered.recv().await;
        self.pc.local_description().await.unwrap()
    }

    /// Apply the answer and every later candidate the server sends.
    ///
    /// Takes the outbound half of the session transport; the inbound half
    /// stays with the caller so signaling remains open.
    pub async fn follow_answer(
        &self,
        mut outbound: mpsc::Receiver<OutgoingSignalingMessage>,
    ) -> JoinHandle<()> {
        let answer = match outbound.recv().await {
            Some(OutgoingSignalingMessage::Answer(answer)) => answer,
            Some(other) => panic!("expected an answer first, got {}", other.kind()),
            None => panic!("outbound closed before the answer"),
        };
        self.pc.set_remote_description(answer).await.unwrap();

        let pc = Arc::clone(&self.pc);
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let OutgoingSignalingMessage::IceCandidate(candidate) = message {
                    let _ = pc.add_ice_candidate(candidate).await;
                }
            }
        })
    }

    /// Write 20 ms of silence to every sending track until `cancel` fires
    pub fn spawn_silence(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let tracks = self.tracks.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(20));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for track in &tracks {
                    let sample = Sample {
                        data: bytes::Bytes::from_static(&[0u8; 160]),
                        duration: Duration::from_millis(20),
                        ..Default::default()
                    };
                    let _ = track.write_sample(&sample).await;
                }
            }
        })
    }

    pub fn ice_connected(&self) -> bool {
        self.pc.ice_connection_state() == RTCIceConnectionState::Connected
    }

    pub async fn close(&self) {
        let _ = self.pc.close().await;
    }
}

