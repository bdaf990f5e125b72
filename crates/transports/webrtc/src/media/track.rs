//! Local track write seam
//!
//! The relay only needs "write this sample"; keeping it behind a trait lets the
//! registry hold engine tracks in production and scripted writers in tests.

use async_trait::async_trait;
use std::sync::Arc;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// A local track the fan-out relay can write samples into
#[async_trait]
pub trait SampleWriter: Send + Sync {
    /// Track identifier, used in logs
    fn id(&self) -> &str;

    async fn write_sample(&self, sample: &Sample) -> crate::Result<()>;
}

#[async_trait]
impl SampleWriter for TrackLocalStaticSample {
    fn id(&self) -> &str {
        TrackLocal::id(self)
    }

    async fn write_sample(&self, sample: &Sample) -> crate::Result<()> {
        TrackLocalStaticSample::write_sample(self, sample)
            .await
            .map_err(|e| crate::Error::MediaTrackError(e.to_string()))
    }
}

/// Shared handle to a local track
pub type SharedWriter = Arc<dyn SampleWriter>;
