//! Intercom server binary entry point
//!
//! Serves WebSocket signaling and streams the shared audio/video capture to
//! every connected browser peer.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: ws://0.0.0.0:8080/signaling/{id}, v4l2 + ALSA capture via ffmpeg
//! cargo run -p intercom-server
//!
//! # Load a YAML config and override parts of it
//! cargo run -p intercom-server -- \
//!   --config ./intercom.yaml \
//!   --port 9000 \
//!   --video-codec h264
//!
//! # Stream prerecorded files and record inbound audio
//! cargo run -p intercom-server -- \
//!   --video-source ./media/clip.ivf \
//!   --audio-source ./media/clip.ogg \
//!   --audio-sink-dir ./recordings
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use intercom_webrtc::config::{MediaSource, ServerConfig, SinkTarget, StreamCodec};
use intercom_webrtc::{SignalingServer, WebrtcHandler};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Capacity of the channel carrying new sessions from the transport
const SESSION_QUEUE: usize = 64;

/// Intercom WebRTC Server
///
/// Shares one audio and one video capture with every browser that connects
/// over WebSocket signaling.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "INTERCOM_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling listen host
    #[arg(long, env = "INTERCOM_HOST")]
    host: Option<String>,

    /// Signaling listen port
    #[arg(short, long, env = "INTERCOM_PORT")]
    port: Option<u16>,

    /// Video source: a file path, or `exec:<program> <args>` for a capture command
    #[arg(long, env = "INTERCOM_VIDEO_SOURCE")]
    video_source: Option<String>,

    /// Video codec (h264, vp8, vp9)
    #[arg(long, env = "INTERCOM_VIDEO_CODEC")]
    video_codec: Option<String>,

    /// Audio source: a file path, or `exec:<program> <args>` for a capture command
    #[arg(long, env = "INTERCOM_AUDIO_SOURCE")]
    audio_source: Option<String>,

    /// Record inbound audio as one Ogg file per session in this directory
    #[arg(long, env = "INTERCOM_AUDIO_SINK_DIR")]
    audio_sink_dir: Option<PathBuf>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "INTERCOM_STUN_SERVERS")]
    stun_servers: Option<Vec<String>>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "INTERCOM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "INTERCOM_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up Ctrl+C handler at the very start
    let shutdown = CancellationToken::new();
    let shutdown_handler = shutdown.clone();
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_handler = Arc::clone(&interrupted);

    ctrlc::set_handler(move || {
        if interrupted_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(130);
        }
        eprintln!("\nCtrl+C received, shutting down...");
        shutdown_handler.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("intercom-worker")
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async_main(args, shutdown))
}

async fn async_main(args: Args, shutdown: CancellationToken) -> Result<()> {
    let config = build_config_from_args(&args)?;
    init_tracing(&config.logging.level, args.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.http.host,
        port = config.http.port,
        video = %config.stream.video_source.codec,
        audio = %config.stream.audio_source.codec,
        stun_servers = config.stream.stun_servers.len(),
        "Intercom server starting"
    );

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let server = SignalingServer::bind(&addr, config.stream.session_buffer)
        .await
        .with_context(|| format!("Failed to bind signaling server on {}", addr))?;

    let handler =
        WebrtcHandler::new(config.stream).context("Failed to set up media pipelines")?;

    let (session_tx, session_rx) = mpsc::channel(SESSION_QUEUE);
    let server_task = server.serve(session_tx, shutdown.clone());
    let mut handle = handler
        .start(session_rx, shutdown.clone())
        .context("Failed to start lifecycle coordinator")?;

    info!("Server running. Press Ctrl+C to shutdown.");

    let fatal = tokio::select! {
        _ = shutdown.cancelled() => None,
        fatal = handle.fatal() => fatal,
    };

    info!("Shutting down...");
    handle.shutdown().await;
    let _ = server_task.await;

    if let Some(err) = fatal {
        error!(error = %err, "Exiting after fatal error");
        return Err(err).context("Media pipeline failed");
    }

    info!("Intercom server shut down gracefully");
    Ok(())
}

/// Load the YAML config (or defaults) and apply command line overrides
fn build_config_from_args(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(host) = &args.host {
        config.http.host = host.clone();
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    let stream = &mut config.stream;
    if let Some(source) = &args.video_source {
        stream.video_source.source = Some(source.parse::<MediaSource>()?);
    }
    if let Some(codec) = &args.video_codec {
        stream.video_source.codec = codec
            .parse::<StreamCodec>()
            .with_context(|| format!("Invalid --video-codec {}", codec))?;
    }
    if let Some(source) = &args.audio_source {
        stream.audio_source.source = Some(source.parse::<MediaSource>()?);
    }
    if let Some(dir) = &args.audio_sink_dir {
        stream.audio_sink.target = SinkTarget::OggDir { dir: dir.clone() };
    }
    if let Some(stun_servers) = &args.stun_servers {
        stream.stun_servers = stun_servers.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_tracing(default_level: &str, format: LogFormat) {
    // RUST_LOG wins over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
