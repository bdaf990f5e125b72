//! Container-stream capture backend
//!
//! Reads an encoded elementary stream out of a container (Ogg/Opus, IVF for
//! VP8/VP9, Annex-B H264) from either a file or the stdout of a capture
//! process, and turns every page/frame/NAL into a [`Sample`]. The reader runs
//! on a dedicated thread because the container parsers are blocking `Read`
//! consumers.

use super::pipeline::{BusMessage, PipelineBackend, PipelineController};
use super::{MediaKind, PipelineState};
use crate::config::{MediaSource, StreamCodec};
use crate::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::media::io::ivf_reader::IVFReader;
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::media::Sample;

/// Opus always runs on a 48 kHz granule clock
const OPUS_CLOCK_RATE: u64 = 48_000;

/// Largest NAL the H264 reader will buffer
const H264_READ_CAPACITY: usize = 1_048_576;

/// [`PipelineBackend`] that demuxes a container stream into samples
pub struct ContainerSource {
    kind: MediaKind,
    codec: StreamCodec,
    source: MediaSource,
    framerate: u32,
    samples: mpsc::Sender<Sample>,
    bus: mpsc::UnboundedSender<BusMessage>,
    state: PipelineState,
    running: Option<RunningReader>,
}

struct RunningReader {
    stop: Arc<AtomicBool>,
    child: Option<Child>,
}

impl ContainerSource {
    pub fn new(
        codec: StreamCodec,
        source: MediaSource,
        framerate: u32,
        samples: mpsc::Sender<Sample>,
        bus: mpsc::UnboundedSender<BusMessage>,
    ) -> Self {
        Self {
            kind: codec.kind(),
            codec,
            source,
            framerate: framerate.max(1),
            samples,
            bus,
            state: PipelineState::Null,
            running: None,
        }
    }

    /// Build a stopped pipeline around a container source.
    ///
    /// Returns the controller plus the bus receiver that should be handed to
    /// [`spawn_bus_watch`](super::spawn_bus_watch).
    pub fn pipeline(
        codec: StreamCodec,
        source: MediaSource,
        framerate: u32,
        sample_buffer: usize,
    ) -> Result<(PipelineController, mpsc::UnboundedReceiver<BusMessage>)> {
        if sample_buffer == 0 {
            return Err(Error::PipelineError(
                "sample buffer must hold at least one sample".to_string(),
            ));
        }
        if let MediaSource::File { path } = &source {
            if !path.is_file() {
                return Err(Error::PipelineError(format!(
                    "{} source {} does not exist",
                    codec,
                    path.display()
                )));
            }
        }

        let (sample_tx, sample_rx) = mpsc::channel(sample_buffer);
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let backend = Self::new(codec, source, framerate, sample_tx, bus_tx);
        let controller = PipelineController::new(codec.kind(), Box::new(backend), sample_rx);
        Ok((controller, bus_rx))
    }

    fn open(&self) -> Result<(Box<dyn Read + Send>, Option<Child>)> {
        match &self.source {
            MediaSource::File { path } => {
                let file = File::open(path)?;
                Ok((Box::new(file), None))
            }
            MediaSource::Command { program, args } => {
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    Error::PipelineError(format!("{} produced no stdout", program))
                })?;
                Ok((Box::new(stdout), Some(child)))
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        let (input, child) = self.open()?;
        let stop = Arc::new(AtomicBool::new(false));

        let reader = StreamReader {
            kind: self.kind,
            codec: self.codec,
            paced: !self.source.is_live(),
            frame_duration: Duration::from_secs(1) / self.framerate,
            stop: Arc::clone(&stop),
            samples: self.samples.clone(),
            bus: self.bus.clone(),
            dropped: 0,
        };

        let spawned = thread::Builder::new()
            .name(format!("{}-source", self.kind))
            .spawn(move || reader.run(input));

        if let Err(e) = spawned {
            if let Some(mut child) = child {
                let _ = child.kill();
                let _ = child.wait();
            }
            return Err(e.into());
        }

        info!(kind = %self.kind, codec = %self.codec, source = %self.source, "Capture source started");
        self.running = Some(RunningReader { stop, child });
        Ok(())
    }

    fn halt(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.stop.store(true, Ordering::SeqCst);
            if let Some(mut child) = running.child.take() {
                if let Err(e) = child.kill() {
                    debug!(kind = %self.kind, error = %e, "Capture process already exited");
                }
                let _ = child.wait();
            }
            info!(kind = %self.kind, "Capture source stopped");
        }
    }
}

impl PipelineBackend for ContainerSource {
    fn state(&self) -> PipelineState {
        self.state
    }

    fn set_state(&mut self, target: PipelineState) -> Result<()> {
        let from = self.state;
        match target {
            PipelineState::Playing => self.start()?,
            PipelineState::Null => self.halt(),
        }
        self.state = target;
        let _ = self.bus.send(BusMessage::StateChanged { from, to: target });
        Ok(())
    }
}

impl Drop for ContainerSource {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Reader thread state
struct StreamReader {
    kind: MediaKind,
    codec: StreamCodec,
    paced: bool,
    frame_duration: Duration,
    stop: Arc<AtomicBool>,
    samples: mpsc::Sender<Sample>,
    bus: mpsc::UnboundedSender<BusMessage>,
    dropped: u64,
}

impl StreamReader {
    fn run(mut self, input: Box<dyn Read + Send>) {
        let outcome = match self.codec {
            StreamCodec::Opus => self.read_ogg(input),
            StreamCodec::Vp8 | StreamCodec::Vp9 => self.read_ivf(input),
            StreamCodec::H264 => self.read_h264(input),
        };

        if self.stop.load(Ordering::SeqCst) {
            debug!(kind = %self.kind, "Reader stopped on request");
            return;
        }

        let message = match outcome {
            Ok(()) => BusMessage::EndOfStream,
            Err(reason) => BusMessage::Error(reason),
        };
        let _ = self.bus.send(message);
    }

    fn read_ogg(&mut self, input: Box<dyn Read + Send>) -> std::result::Result<(), String> {
        let (mut ogg, _header) =
            OggReader::new(input, true).map_err(|e| format!("invalid ogg stream: {}", e))?;

        let mut last_granule: u64 = 0;
        while !self.stop.load(Ordering::SeqCst) {
            let (page, header) = match ogg.parse_next_page() {
                Ok(next) => next,
                Err(e) => {
                    debug!(kind = %self.kind, error = %e, "Ogg stream ended");
                    return Ok(());
                }
            };

            let Some(duration) = ogg_page_duration(header.granule_position, last_granule) else {
                continue;
            };
            last_granule = header.granule_position;

            if !self.emit(page.freeze(), duration) {
                return Ok(());
            }
        }
        Ok(())
    }

    fn read_ivf(&mut self, input: Box<dyn Read + Send>) -> std::result::Result<(), String> {
        let (mut ivf, header) =
            IVFReader::new(input).map_err(|e| format!("invalid ivf stream: {}", e))?;

        let timebase = (header.timebase_numerator, header.timebase_denominator);
        let mut last_timestamp: Option<u64> = None;

        while !self.stop.load(Ordering::SeqCst) {
            let (frame, frame_header) = match ivf.parse_next_frame() {
                Ok(next) => next,
                Err(e) => {
                    debug!(kind = %self.kind, error = %e, "IVF stream ended");
                    return Ok(());
                }
            };

            let ticks = last_timestamp.map(|last| frame_header.timestamp.saturating_sub(last));
            last_timestamp = Some(frame_header.timestamp);
            let duration = ivf_frame_duration(timebase, ticks, self.frame_duration);

            if !self.emit(frame.freeze(), duration) {
                return Ok(());
            }
        }
        Ok(())
    }

    fn read_h264(&mut self, input: Box<dyn Read + Send>) -> std::result::Result<(), String> {
        let mut h264 = H264Reader::new(input, H264_READ_CAPACITY);
        let duration = self.frame_duration;

        while !self.stop.load(Ordering::SeqCst) {
            let nal = match h264.next_nal() {
                Ok(nal) => nal,
                Err(e) => {
                    debug!(kind = %self.kind, error = %e, "H264 stream ended");
                    return Ok(());
                }
            };

            if !self.emit(nal.data.freeze(), duration) {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Queue one sample without blocking. Returns false once nobody is consuming.
    fn emit(&mut self, data: bytes::Bytes, duration: Duration) -> bool {
        let sample = Sample {
            data,
            timestamp: SystemTime::now(),
            duration,
            ..Default::default()
        };

        match self.samples.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                debug!(kind = %self.kind, dropped = self.dropped, "Sample queue full, dropping sample");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(kind = %self.kind, "Sample queue closed, stopping reader");
                return false;
            }
        }

        if self.paced {
            thread::sleep(duration);
        }
        true
    }
}

/// Playback time covered by an Opus page.
///
/// `None` for header pages (granule 0) and for pages on which no packet
/// finishes (granule -1); neither carries a playable unit.
fn ogg_page_duration(granule: u64, last_granule: u64) -> Option<Duration> {
    if granule == 0 || granule == u64::MAX {
        return None;
    }
    let sample_count = granule.saturating_sub(last_granule);
    Some(scaled_duration(sample_count, 1, OPUS_CLOCK_RATE))
}

/// Duration of one IVF frame: the timestamp advance since the previous frame
/// scaled by the file timebase. Falls back to the configured frame duration
/// for the first frame, a degenerate timebase, or a zero advance.
fn ivf_frame_duration(timebase: (u32, u32), ticks: Option<u64>, fallback: Duration) -> Duration {
    let (numerator, denominator) = timebase;
    match ticks {
        Some(ticks) if ticks > 0 && numerator > 0 && denominator > 0 => {
            scaled_duration(ticks, numerator as u64, denominator as u64)
        }
        _ => fallback,
    }
}

/// `ticks * numerator / denominator` seconds, saturating
fn scaled_duration(ticks: u64, numerator: u64, denominator: u64) -> Duration {
    let nanos = ticks as u128 * numerator as u128 * 1_000_000_000 / denominator.max(1) as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal IVF file: 32-byte header followed by frames with 12-byte headers
    fn write_ivf(path: &std::path::Path, frames: &[&[u8]]) {
        let mut out = Vec::new();
        out.extend_from_slice(b"DKIF");
        out.extend_from_slice(&0u16.to_le_bytes()); // version
        out.extend_from_slice(&32u16.to_le_bytes()); // header size
        out.extend_from_slice(b"VP80");
        out.extend_from_slice(&640u16.to_le_bytes());
        out.extend_from_slice(&480u16.to_le_bytes());
        out.extend_from_slice(&1000u32.to_le_bytes()); // timebase denominator
        out.extend_from_slice(&1u32.to_le_bytes()); // timebase numerator
        out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for (i, frame) in frames.iter().enumerate() {
            out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            out.extend_from_slice(&(i as u64).to_le_bytes());
            out.extend_from_slice(frame);
        }
        std::fs::File::create(path).unwrap().write_all(&out).unwrap();
    }

    #[test]
    fn test_missing_file_is_rejected_at_construction() {
        let result = ContainerSource::pipeline(
            StreamCodec::Vp8,
            MediaSource::File {
                path: "/nonexistent/clip.ivf".into(),
            },
            30,
            100,
        );
        assert!(matches!(result, Err(Error::PipelineError(_))));
    }

    #[tokio::test]
    async fn test_ivf_file_produces_samples_then_end_of_stream() {
        use crate::media::MediaPipeline;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.ivf");
        write_ivf(&path, &[b"frame-one", b"frame-two", b"frame-three"]);

        let (pipeline, mut bus) =
            ContainerSource::pipeline(StreamCodec::Vp8, MediaSource::File { path }, 30, 100)
                .unwrap();
        let mut samples = pipeline.take_samples().unwrap();

        pipeline.ensure_playing().unwrap();

        let mut frames = Vec::new();
        let mut durations = Vec::new();
        for _ in 0..3 {
            let sample = tokio::time::timeout(Duration::from_secs(2), samples.recv())
                .await
                .unwrap()
                .unwrap();
            durations.push(sample.duration);
            frames.push(sample.data);
        }
        // First frame has no predecessor and runs at the configured rate
        assert_eq!(durations[0], Duration::from_secs(1) / 30);
        assert_eq!(durations[1], Duration::from_millis(1));
        assert_eq!(durations[2], Duration::from_millis(1));
        assert_eq!(frames[0].as_ref(), b"frame-one");
        assert_eq!(frames[2].as_ref(), b"frame-three");

        let mut saw_eos = false;
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_secs(2), bus.recv()).await
        {
            if message == BusMessage::EndOfStream {
                saw_eos = true;
                break;
            }
        }
        assert!(saw_eos);

        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Null);
    }

    #[tokio::test]
    async fn test_failing_command_is_a_state_error() {
        use crate::media::MediaPipeline;

        let (pipeline, _bus) = ContainerSource::pipeline(
            StreamCodec::Opus,
            MediaSource::Command {
                program: "/nonexistent/capture-binary".to_string(),
                args: vec![],
            },
            30,
            10,
        )
        .unwrap();

        let err = pipeline.ensure_playing().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(pipeline.state(), PipelineState::Null);
    }

    #[test]
    fn test_ogg_page_duration() {
        // 20 ms of Opus at 48 kHz
        assert_eq!(
            ogg_page_duration(960, 0),
            Some(Duration::from_millis(20))
        );
        assert_eq!(
            ogg_page_duration(48_000 + 960, 48_000),
            Some(Duration::from_millis(20))
        );

        // Header page and a page that finishes no packet
        assert_eq!(ogg_page_duration(0, 0), None);
        assert_eq!(ogg_page_duration(u64::MAX, 960), None);

        // A granule that runs backwards yields an empty duration, not a wrap
        assert_eq!(ogg_page_duration(100, 960), Some(Duration::ZERO));
    }

    #[test]
    fn test_ivf_frame_duration_uses_timestamp_advance() {
        let fallback = Duration::from_secs(1) / 30;

        // 90 kHz timebase, 3000 ticks per frame
        assert_eq!(
            ivf_frame_duration((1, 90_000), Some(3000), fallback),
            Duration::from_nanos(33_333_333)
        );

        // One tick per frame at 1/30
        assert_eq!(ivf_frame_duration((1, 30), Some(1), fallback), fallback);
        assert_eq!(
            ivf_frame_duration((1, 1000), Some(40), fallback),
            Duration::from_millis(40)
        );

        assert_eq!(ivf_frame_duration((1, 90_000), None, fallback), fallback);
        assert_eq!(ivf_frame_duration((1, 90_000), Some(0), fallback), fallback);
        assert_eq!(ivf_frame_duration((1, 0), Some(3000), fallback), fallback);
    }
}
