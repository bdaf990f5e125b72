//! Capture pipeline state control
//!
//! [`PipelineController`] owns a [`PipelineBackend`] (the engine that actually
//! captures and encodes) and exposes the play/stop contract the lifecycle
//! coordinator relies on. The "already in state" check lives here so that no
//! duplicate transition ever reaches the backend.

use super::{MediaKind, PipelineState};
use crate::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::media::Sample;

/// Receiving half of a pipeline's bounded sample queue
pub type SampleQueue = mpsc::Receiver<Sample>;

/// Out-of-band notifications from a running pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// The source ran out of data
    EndOfStream,

    /// The source or an element failed while playing
    Error(String),

    /// The backend completed a state transition
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
}

/// Engine behind a capture pipeline
pub trait PipelineBackend: Send {
    /// Current engine state
    fn state(&self) -> PipelineState;

    /// Drive the engine to `target`
    fn set_state(&mut self, target: PipelineState) -> Result<()>;
}

/// Capture pipeline contract consumed by the lifecycle coordinator and the relay
pub trait MediaPipeline: Send + Sync {
    fn kind(&self) -> MediaKind;

    fn state(&self) -> PipelineState;

    /// Start capturing unless already playing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PipelineStateError`] when the engine refuses the transition.
    fn ensure_playing(&self) -> Result<()>;

    /// Stop capturing unless already stopped.
    fn stop(&self) -> Result<()>;

    /// Hand out the sample queue. Only the first call returns it.
    fn take_samples(&self) -> Option<SampleQueue>;
}

/// [`MediaPipeline`] over any [`PipelineBackend`]
pub struct PipelineController {
    kind: MediaKind,
    backend: Mutex<Box<dyn PipelineBackend>>,
    samples: Mutex<Option<SampleQueue>>,
}

impl PipelineController {
    pub fn new(kind: MediaKind, backend: Box<dyn PipelineBackend>, samples: SampleQueue) -> Self {
        Self {
            kind,
            backend: Mutex::new(backend),
            samples: Mutex::new(Some(samples)),
        }
    }

    fn transition(&self, target: PipelineState) -> Result<()> {
        let mut backend = self.backend.lock();
        if backend.state() == target {
            debug!(kind = %self.kind, state = %target, "Pipeline already in requested state");
            return Ok(());
        }

        backend
            .set_state(target)
            .map_err(|e| Error::PipelineStateError {
                kind: self.kind,
                target,
                reason: e.to_string(),
            })?;

        info!(kind = %self.kind, state = %target, "Pipeline state changed");
        Ok(())
    }
}

impl MediaPipeline for PipelineController {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn state(&self) -> PipelineState {
        self.backend.lock().state()
    }

    fn ensure_playing(&self) -> Result<()> {
        self.transition(PipelineState::Playing)
    }

    fn stop(&self) -> Result<()> {
        self.transition(PipelineState::Null)
    }

    fn take_samples(&self) -> Option<SampleQueue> {
        self.samples.lock().take()
    }
}

/// Drain a pipeline's bus, logging what it reports.
///
/// End of stream and element errors are logged only; the watcher never stops
/// the pipeline or the process. It exits once every bus sender is gone.
pub fn spawn_bus_watch(
    kind: MediaKind,
    mut bus: mpsc::UnboundedReceiver<BusMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = bus.recv().await {
            match message {
                BusMessage::EndOfStream => {
                    warn!(kind = %kind, "Pipeline reached end of stream");
                }
                BusMessage::Error(reason) => {
                    error!(kind = %kind, error = %reason, "Pipeline element error");
                }
                BusMessage::StateChanged { from, to } => {
                    debug!(kind = %kind, from = %from, to = %to, "Pipeline bus state change");
                }
            }
        }
        debug!(kind = %kind, "Pipeline bus closed");
    })
}
