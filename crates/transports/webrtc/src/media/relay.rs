//! Fan-out relay: one task per media kind
//!
//! The relay never writes to a track itself. Every registered peer gets a
//! writer task fed through a short bounded queue, and the relay only offers
//! each sample with `try_send`. A peer whose queue is full loses that sample;
//! the others are unaffected.

use super::pipeline::SampleQueue;
use super::track::SharedWriter;
use super::MediaKind;
use crate::peer::PeerRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::media::Sample;

/// Upper bound on a single track write before the sample is abandoned
pub const TRACK_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Samples buffered per peer before the relay starts dropping for that peer
pub const PEER_QUEUE_DEPTH: usize = 8;

/// Field-wise copy of a sample; `webrtc::media::Sample` does not implement `Clone`
fn clone_sample(sample: &Sample) -> Sample {
    Sample {
        data: sample.data.clone(),
        timestamp: sample.timestamp,
        duration: sample.duration,
        packet_timestamp: sample.packet_timestamp,
        prev_dropped_packets: sample.prev_dropped_packets,
        prev_padding_packets: sample.prev_padding_packets,
    }
}

/// Relay-side handle to one peer's writer task
struct PeerWriter {
    track: SharedWriter,
    queue: mpsc::Sender<Sample>,
    dropped: u64,
}

impl PeerWriter {
    /// Spawn the writer task for one peer track.
    ///
    /// The task drains its queue in order and exits when the queue closes or
    /// either the peer scope or the relay is cancelled.
    fn spawn(
        kind: MediaKind,
        session_id: &str,
        track: SharedWriter,
        peer_cancel: CancellationToken,
        relay_cancel: CancellationToken,
    ) -> Self {
        let (queue, mut rx) = mpsc::channel::<Sample>(PEER_QUEUE_DEPTH);
        let writer = Arc::clone(&track);
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            debug!(session_id = %session_id, kind = %kind, "Peer writer started");
            loop {
                let sample = tokio::select! {
                    biased;
                    _ = peer_cancel.cancelled() => break,
                    _ = relay_cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(sample) => sample,
                        None => break,
                    },
                };

                let outcome = tokio::select! {
                    biased;
                    _ = peer_cancel.cancelled() => break,
                    _ = relay_cancel.cancelled() => break,
                    outcome = tokio::time::timeout(TRACK_WRITE_TIMEOUT, writer.write_sample(&sample)) => outcome,
                };

                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(session_id = %session_id, kind = %kind, error = %e, "Track write failed");
                    }
                    Err(_) => {
                        warn!(session_id = %session_id, kind = %kind, "Track write timed out");
                    }
                }
            }
            debug!(session_id = %session_id, kind = %kind, "Peer writer stopped");
        });

        Self {
            track,
            queue,
            dropped: 0,
        }
    }
}

/// Spawn the relay for one media kind.
///
/// Each sample is offered to every peer registered at the time it is read, in
/// production order. A slow or blocked peer only loses its own
/// samples. The task ends when `cancel` fires or the pipeline's sample queue
/// closes.
pub fn spawn_fanout(
    kind: MediaKind,
    mut samples: SampleQueue,
    registry: Arc<PeerRegistry>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(kind = %kind, "Fan-out relay started");
        let mut writers: HashMap<String, PeerWriter> = HashMap::new();
        let mut relayed: u64 = 0;

        loop {
            let sample = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = samples.recv() => match next {
                    Some(sample) => sample,
                    None => {
                        debug!(kind = %kind, "Sample queue closed");
                        break;
                    }
                },
            };

            // A reconnect under the same id brings a new track and a new writer
            let mut live = Vec::with_capacity(writers.len());
            registry.for_each(|session_id, state| {
                let track = state.track(kind);
                let current = writers
                    .get(session_id)
                    .is_some_and(|writer| Arc::ptr_eq(&writer.track, track));
                if !current {
                    writers.insert(
                        session_id.to_string(),
                        PeerWriter::spawn(
                            kind,
                            session_id,
                            Arc::clone(track),
                            state.cancel.clone(),
                            cancel.clone(),
                        ),
                    );
                }
                live.push(session_id.to_string());
            });
            writers.retain(|session_id, _| live.contains(session_id));

            for (session_id, writer) in writers.iter_mut() {
                match writer.queue.try_send(clone_sample(&sample)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        writer.dropped += 1;
                        if writer.dropped == 1 || writer.dropped % 100 == 0 {
                            debug!(
                                session_id = %session_id,
                                kind = %kind,
                                dropped = writer.dropped,
                                "Peer queue full, dropping sample"
                            );
                        }
                    }
                    // Writer already ended with its peer scope
                    Err(TrySendError::Closed(_)) => {}
                }
            }

            relayed += 1;
        }

        info!(kind = %kind, samples = relayed, peers = writers.len(), "Fan-out relay stopped");
    })
}
