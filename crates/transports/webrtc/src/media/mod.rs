//! Media pipelines (capture sources, inbound sinks) and the fan-out relay
//!
//! One capture pipeline exists per media kind for the life of the process.
//! Its sample queue is drained by a single relay task that writes every
//! sample into each registered peer's local track.

pub mod pipeline;
pub mod relay;
pub mod sink;
pub mod source;
pub mod track;

pub use pipeline::{
    spawn_bus_watch, BusMessage, MediaPipeline, PipelineBackend, PipelineController, SampleQueue,
};
pub use relay::spawn_fanout;
pub use sink::{NullSink, OggFileSink, SinkFactory, SinkPipeline, TargetSinkFactory};
pub use source::ContainerSource;
pub use track::SampleWriter;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Media kind carried by a pipeline or track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Play state of a capture pipeline
///
/// Pipelines only ever move between `Null` and `Playing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Null,
    Playing,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Null => f.write_str("null"),
            PipelineState::Playing => f.write_str("playing"),
        }
    }
}
