//! Lifecycle coordinator
//!
//! Consumes session handles from the signaling transport, builds one
//! [`PeerController`] per session, keeps the [`PeerRegistry`] in step with
//! connected peers, and starts or stops the capture pipelines as the registry
//! fills and empties.
//!
//! Pipeline state transitions happen inside the registry's critical section,
//! so a peer arriving while the last one leaves can never observe a stopped
//! pipeline after registering.

use crate::config::StreamConfig;
use crate::media::{
    spawn_bus_watch, spawn_fanout, ContainerSource, MediaKind, MediaPipeline, SinkFactory,
    TargetSinkFactory,
};
use crate::peer::{PeerController, PeerRegistry};
use crate::signaling::SessionHandle;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for background tasks in [`WebrtcHandle::shutdown`]
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The two process-wide capture pipelines
#[derive(Clone)]
pub struct MediaPipelines {
    pub audio: Arc<dyn MediaPipeline>,
    pub video: Arc<dyn MediaPipeline>,
}

impl MediaPipelines {
    pub fn new(audio: Arc<dyn MediaPipeline>, video: Arc<dyn MediaPipeline>) -> Self {
        Self { audio, video }
    }

    /// Build stopped container pipelines for the configured sources.
    ///
    /// Must run inside a tokio runtime: each pipeline gets a bus watcher task.
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        let video = &config.video_source;
        let (video_pipeline, video_bus) = ContainerSource::pipeline(
            video.codec,
            video.resolve_source(),
            video.framerate,
            config.sample_buffer,
        )?;

        let audio = &config.audio_source;
        let (audio_pipeline, audio_bus) = ContainerSource::pipeline(
            audio.codec,
            audio.resolve_source(),
            // only H264 timing reads the framerate
            0,
            config.sample_buffer,
        )?;

        spawn_bus_watch(MediaKind::Audio, audio_bus);
        spawn_bus_watch(MediaKind::Video, video_bus);

        info!(
            audio = %audio.codec,
            video = %video.codec,
            "Media pipelines constructed"
        );

        Ok(Self::new(Arc::new(audio_pipeline), Arc::new(video_pipeline)))
    }

    pub fn get(&self, kind: MediaKind) -> &Arc<dyn MediaPipeline> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    /// Start both pipelines; a pipeline already playing is left alone
    pub fn ensure_playing(&self) -> Result<()> {
        self.audio.ensure_playing()?;
        self.video.ensure_playing()
    }

    /// Stop both pipelines; a pipeline already stopped is left alone
    pub fn stop(&self) -> Result<()> {
        let audio = self.audio.stop();
        let video = self.video.stop();
        audio.and(video)
    }
}

/// State shared by the intake loop and every session task
struct Shared {
    config: StreamConfig,
    registry: Arc<PeerRegistry>,
    pipelines: MediaPipelines,
    sinks: Arc<dyn SinkFactory>,
    root: CancellationToken,
    fatal: Mutex<Option<oneshot::Sender<Error>>>,
}

impl Shared {
    /// Record a fatal pipeline error and cancel everything.
    ///
    /// Only the first error reaches [`WebrtcHandle::fatal`].
    fn fail(&self, err: Error) {
        error!(error = %err, "Fatal media pipeline error, shutting down");
        if let Some(tx) = self.fatal.lock().take() {
            let _ = tx.send(err);
        }
        self.root.cancel();
    }

    async fn run_session(self: Arc<Self>, session: SessionHandle) {
        let SessionHandle {
            id,
            inbound,
            outbound,
        } = session;
        let cancel = self.root.child_token();

        let controller = match PeerController::create(
            &id,
            &self.config,
            Arc::clone(&self.sinks),
            outbound,
            cancel,
        )
        .await
        {
            Ok(controller) => controller,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to set up peer, dropping session");
                return;
            }
        };

        let pipelines = &self.pipelines;
        let started = self
            .registry
            .register_with(&id, controller.peer_state(), |_| pipelines.ensure_playing());

        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(e),
            Err(e) => {
                warn!(session_id = %id, error = %e, "Rejecting session");
                controller.close().await;
                return;
            }
        }

        controller.run(inbound).await;
        controller.close().await;

        let mut stop_failure = None;
        self.registry.remove_with(&id, |remaining| {
            if remaining == 0 {
                info!("Last peer gone, stopping media pipelines");
                if let Err(e) = pipelines.stop() {
                    stop_failure = Some(e);
                }
            }
        });

        if let Some(e) = stop_failure {
            self.fail(e);
        }
    }
}

/// Builds the coordinator from a stream configuration
pub struct WebrtcHandler {
    config: StreamConfig,
    pipelines: MediaPipelines,
    sinks: Arc<dyn SinkFactory>,
}

impl WebrtcHandler {
    /// Validate `config` and construct the capture pipelines and the inbound sink.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or a pipeline cannot be built.
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let pipelines = MediaPipelines::from_config(&config)?;
        let sinks = Arc::new(TargetSinkFactory::new(config.audio_sink.clone())?);
        Ok(Self::with_parts(config, pipelines, sinks))
    }

    /// Use caller-supplied pipelines and sinks
    pub fn with_parts(
        config: StreamConfig,
        pipelines: MediaPipelines,
        sinks: Arc<dyn SinkFactory>,
    ) -> Self {
        Self {
            config,
            pipelines,
            sinks,
        }
    }

    /// Start the relays and begin consuming `sessions`.
    ///
    /// Session setup runs on its own task, so a slow or failing session never
    /// holds up intake. Cancelling `shutdown` stops intake and tears down every
    /// peer.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or a pipeline's sample queue has
    /// already been taken.
    pub fn start(
        self,
        mut sessions: mpsc::Receiver<SessionHandle>,
        shutdown: CancellationToken,
    ) -> Result<WebrtcHandle> {
        self.config.validate()?;

        let audio_samples = self.pipelines.audio.take_samples();
        let video_samples = self.pipelines.video.take_samples();
        let (Some(audio_samples), Some(video_samples)) = (audio_samples, video_samples) else {
            return Err(Error::PipelineError(
                "pipeline sample queues are already in use".to_string(),
            ));
        };

        let registry = Arc::new(PeerRegistry::new());
        let (fatal_tx, fatal_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            config: self.config,
            registry: Arc::clone(&registry),
            pipelines: self.pipelines.clone(),
            sinks: self.sinks,
            root: shutdown.clone(),
            fatal: Mutex::new(Some(fatal_tx)),
        });

        let relays = vec![
            spawn_fanout(
                MediaKind::Audio,
                audio_samples,
                Arc::clone(&registry),
                shutdown.child_token(),
            ),
            spawn_fanout(
                MediaKind::Video,
                video_samples,
                Arc::clone(&registry),
                shutdown.child_token(),
            ),
        ];

        let intake = tokio::spawn(async move {
            info!("Session intake started");
            let mut active = JoinSet::new();

            loop {
                tokio::select! {
                    biased;
                    _ = shared.root.cancelled() => break,
                    Some(_) = active.join_next(), if !active.is_empty() => {}
                    next = sessions.recv() => match next {
                        Some(session) => {
                            debug!(session_id = %session.id, "New signaling session");
                            active.spawn(Arc::clone(&shared).run_session(session));
                        }
                        None => {
                            info!("Session source closed");
                            break;
                        }
                    },
                }
            }

            // Sessions still running end through their own scopes
            while active.join_next().await.is_some() {}
            info!("Session intake stopped");
        });

        Ok(WebrtcHandle {
            registry,
            pipelines: self.pipelines,
            shutdown,
            fatal: Some(fatal_rx),
            intake,
            relays,
        })
    }
}

/// Running coordinator
pub struct WebrtcHandle {
    registry: Arc<PeerRegistry>,
    pipelines: MediaPipelines,
    shutdown: CancellationToken,
    fatal: Option<oneshot::Receiver<Error>>,
    intake: JoinHandle<()>,
    relays: Vec<JoinHandle<()>>,
}

impl WebrtcHandle {
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn pipelines(&self) -> &MediaPipelines {
        &self.pipelines
    }

    /// Resolves with the first fatal pipeline error.
    ///
    /// Returns `None` once the coordinator has stopped without one, and on
    /// every call after the first resolution.
    pub async fn fatal(&mut self) -> Option<Error> {
        let rx = self.fatal.as_mut()?;
        let result = rx.await.ok();
        self.fatal = None;
        result
    }

    /// Cancel every scope and wait for intake and the relays to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        let mut tasks = self.relays;
        tasks.push(self.intake);
        let all = futures::future::join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, all).await.is_err() {
            warn!("Timed out waiting for coordinator tasks to finish");
        }
        info!(peers = self.registry.len(), "Coordinator stopped");
    }
}
