//! Configuration types for the intercom server and its media pipelines

use crate::media::MediaKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};

/// Top-level YAML document for the server binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Signaling listener
    pub http: HttpConfig,

    /// Log filter used when `RUST_LOG` is not set
    pub logging: LoggingConfig,

    /// Capture, playback, and peer settings
    pub stream: StreamConfig,
}

/// Signaling listener address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive (default: "debug")
    pub level: String,
}

/// Stream and media configuration handed to the lifecycle coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// STUN server URLs given to every peer connection
    pub stun_servers: Vec<String>,

    /// Outbound video capture
    pub video_source: VideoSourceConfig,

    /// Outbound audio capture
    pub audio_source: AudioSourceConfig,

    /// Inbound audio playback
    pub audio_sink: AudioSinkConfig,

    /// Depth of each pipeline's sample queue (default: 100)
    pub sample_buffer: usize,

    /// Interval between picture loss indications on inbound tracks (default: 3000ms)
    pub pli_interval_ms: u64,

    /// Per-read buffer for inbound RTP packets (default: 1400 bytes)
    pub read_buffer_size: usize,

    /// Capacity of each session's inbound and outbound signaling channels (default: 10)
    pub session_buffer: usize,
}

/// Encoded stream formats understood by the pipelines and the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCodec {
    H264,
    Vp8,
    Vp9,
    Opus,
}

impl StreamCodec {
    /// RTP MIME type registered with the media engine
    pub fn mime_type(&self) -> &'static str {
        match self {
            StreamCodec::H264 => MIME_TYPE_H264,
            StreamCodec::Vp8 => MIME_TYPE_VP8,
            StreamCodec::Vp9 => MIME_TYPE_VP9,
            StreamCodec::Opus => MIME_TYPE_OPUS,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            StreamCodec::Opus => MediaKind::Audio,
            StreamCodec::H264 | StreamCodec::Vp8 | StreamCodec::Vp9 => MediaKind::Video,
        }
    }

    /// Whether a negotiated MIME type carries this codec (case-insensitive)
    pub fn matches_mime(&self, mime_type: &str) -> bool {
        self.mime_type().eq_ignore_ascii_case(mime_type)
    }
}

impl fmt::Display for StreamCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamCodec::H264 => "h264",
            StreamCodec::Vp8 => "vp8",
            StreamCodec::Vp9 => "vp9",
            StreamCodec::Opus => "opus",
        };
        f.write_str(name)
    }
}

impl FromStr for StreamCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h264" => Ok(StreamCodec::H264),
            "vp8" => Ok(StreamCodec::Vp8),
            "vp9" => Ok(StreamCodec::Vp9),
            "opus" => Ok(StreamCodec::Opus),
            other => Err(Error::InvalidConfig(format!("unknown codec: {}", other))),
        }
    }
}

/// Where a capture pipeline reads its encoded stream from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaSource {
    /// Container file replayed at its own pace
    File { path: PathBuf },

    /// Capture process writing a live container stream to stdout
    Command { program: String, args: Vec<String> },
}

impl MediaSource {
    /// Live sources are not paced: the capture process already runs in real time.
    pub fn is_live(&self) -> bool {
        matches!(self, MediaSource::Command { .. })
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::File { path } => write!(f, "{}", path.display()),
            MediaSource::Command { program, args } => {
                write!(f, "exec:{}", program)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
        }
    }
}

/// Parses `exec:<program> <args...>` as a capture command and anything else as a file path.
impl FromStr for MediaSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidConfig("empty media source".to_string()));
        }

        match s.strip_prefix("exec:") {
            Some(command) => {
                let mut parts = command.split_whitespace().map(str::to_string);
                let program = parts.next().ok_or_else(|| {
                    Error::InvalidConfig("exec: source without a program".to_string())
                })?;
                Ok(MediaSource::Command {
                    program,
                    args: parts.collect(),
                })
            }
            None => Ok(MediaSource::File {
                path: PathBuf::from(s),
            }),
        }
    }
}

/// Video capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSourceConfig {
    /// Capture device (default: /dev/video0)
    pub device: String,
    pub codec: StreamCodec,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Target bitrate in kbps
    pub bitrate: u32,
    /// Insert an input queue in front of the encoder
    pub queue: bool,
    /// Explicit source; when unset a capture command is derived from the fields above
    pub source: Option<MediaSource>,
}

/// Audio capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSourceConfig {
    /// ALSA capture device (default: "default")
    pub device: String,
    pub codec: StreamCodec,
    pub channels: u16,
    /// Target bitrate in kbps
    pub bitrate: u32,
    pub queue: bool,
    pub source: Option<MediaSource>,
}

/// Inbound audio playback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSinkConfig {
    /// Codec accepted on inbound tracks; anything else is dropped
    pub codec: StreamCodec,
    /// Ogg channel count, 1 or 2
    pub channels: u8,
    pub clock_rate: u32,
    pub target: SinkTarget,
}

/// Destination for inbound audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkTarget {
    /// Count and discard packets
    Null,

    /// Record each session to `<dir>/<session_id>.ogg`
    OggDir { dir: PathBuf },
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            video_source: VideoSourceConfig::default(),
            audio_source: AudioSourceConfig::default(),
            audio_sink: AudioSinkConfig::default(),
            sample_buffer: 100,
            pli_interval_ms: 3000,
            read_buffer_size: 1400,
            session_buffer: 10,
        }
    }
}

impl Default for VideoSourceConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            codec: StreamCodec::Vp8,
            width: 640,
            height: 480,
            framerate: 30,
            bitrate: 300,
            queue: false,
            source: None,
        }
    }
}

impl Default for AudioSourceConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            codec: StreamCodec::Opus,
            channels: 1,
            bitrate: 64,
            queue: false,
            source: None,
        }
    }
}

impl Default for AudioSinkConfig {
    fn default() -> Self {
        Self {
            codec: StreamCodec::Opus,
            channels: 1,
            clock_rate: 48000,
            target: SinkTarget::Null,
        }
    }
}

impl ServerConfig {
    /// Load a YAML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|e| {
            Error::InvalidConfig(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.http.port == 0 {
            return Err(Error::InvalidConfig("http.port must be non-zero".to_string()));
        }
        self.stream.validate()
    }
}

impl StreamConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - a queue or buffer size is zero
    /// - `pli_interval_ms` is zero
    /// - the video source codec is not a video codec
    /// - the audio source or sink codec is not an audio codec
    /// - the audio sink channel count is not 1 or 2
    /// - the video geometry or framerate is zero
    pub fn validate(&self) -> Result<()> {
        if self.sample_buffer == 0 {
            return Err(Error::InvalidConfig(
                "sample_buffer must be at least 1".to_string(),
            ));
        }

        if self.session_buffer == 0 {
            return Err(Error::InvalidConfig(
                "session_buffer must be at least 1".to_string(),
            ));
        }

        if self.read_buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "read_buffer_size must be at least 1".to_string(),
            ));
        }

        if self.pli_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "pli_interval_ms must be non-zero".to_string(),
            ));
        }

        if self.video_source.codec.kind() != MediaKind::Video {
            return Err(Error::InvalidConfig(format!(
                "video_source.codec must be a video codec, got {}",
                self.video_source.codec
            )));
        }

        if self.audio_source.codec.kind() != MediaKind::Audio {
            return Err(Error::InvalidConfig(format!(
                "audio_source.codec must be an audio codec, got {}",
                self.audio_source.codec
            )));
        }

        if self.audio_sink.codec.kind() != MediaKind::Audio {
            return Err(Error::InvalidConfig(format!(
                "audio_sink.codec must be an audio codec, got {}",
                self.audio_sink.codec
            )));
        }

        if !(1..=2).contains(&self.audio_sink.channels) {
            return Err(Error::InvalidConfig(format!(
                "audio_sink.channels must be 1 or 2, got {}",
                self.audio_sink.channels
            )));
        }

        let video = &self.video_source;
        if video.width == 0 || video.height == 0 || video.framerate == 0 {
            return Err(Error::InvalidConfig(format!(
                "video geometry must be non-zero, got {}x{}@{}",
                video.width, video.height, video.framerate
            )));
        }

        Ok(())
    }

    pub fn pli_interval(&self) -> Duration {
        Duration::from_millis(self.pli_interval_ms)
    }

    /// Set the STUN servers
    pub fn with_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }

    /// Set where inbound audio goes
    pub fn with_sink_target(mut self, target: SinkTarget) -> Self {
        self.audio_sink.target = target;
        self
    }
}

impl VideoSourceConfig {
    /// The configured source, or an ffmpeg V4L2 capture writing the codec's container to stdout
    pub fn resolve_source(&self) -> MediaSource {
        if let Some(source) = &self.source {
            return source.clone();
        }

        let mut args = ffmpeg_prelude(self.queue);
        push_args(&mut args, &["-f", "v4l2", "-framerate"]);
        args.push(self.framerate.to_string());
        args.push("-video_size".to_string());
        args.push(format!("{}x{}", self.width, self.height));
        args.push("-i".to_string());
        args.push(self.device.clone());

        match self.codec {
            StreamCodec::H264 => push_args(&mut args, &["-c:v", "libx264", "-tune", "zerolatency"]),
            StreamCodec::Vp9 => push_args(&mut args, &["-c:v", "libvpx-vp9", "-deadline", "realtime"]),
            StreamCodec::Vp8 | StreamCodec::Opus => {
                push_args(&mut args, &["-c:v", "libvpx", "-deadline", "realtime"])
            }
        }
        args.push("-b:v".to_string());
        args.push(format!("{}k", self.bitrate));

        let container = if self.codec == StreamCodec::H264 { "h264" } else { "ivf" };
        push_args(&mut args, &["-f", container, "-"]);

        MediaSource::Command {
            program: "ffmpeg".to_string(),
            args,
        }
    }
}

impl AudioSourceConfig {
    /// The configured source, or an ffmpeg ALSA capture writing Ogg/Opus to stdout
    pub fn resolve_source(&self) -> MediaSource {
        if let Some(source) = &self.source {
            return source.clone();
        }

        let mut args = ffmpeg_prelude(self.queue);
        push_args(&mut args, &["-f", "alsa", "-ac"]);
        args.push(self.channels.to_string());
        args.push("-i".to_string());
        args.push(self.device.clone());
        push_args(&mut args, &["-c:a", "libopus", "-b:a"]);
        args.push(format!("{}k", self.bitrate));
        push_args(&mut args, &["-page_duration", "20000", "-f", "ogg", "-"]);

        MediaSource::Command {
            program: "ffmpeg".to_string(),
            args,
        }
    }
}

fn ffmpeg_prelude(queue: bool) -> Vec<String> {
    let mut args = Vec::new();
    push_args(&mut args, &["-hide_banner", "-loglevel", "error"]);
    if queue {
        push_args(&mut args, &["-thread_queue_size", "512"]);
    }
    args
}

fn push_args(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}
