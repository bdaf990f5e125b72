//! Peer registry
//!
//! Maps session ids to the state the relay and teardown paths need: the two
//! local tracks and the peer's cancellation scope. A single mutex guards every
//! read, write, and iteration. Iteration copies the entries out before the
//! lock is released, so callers never write to a track while holding it.

use crate::media::track::SharedWriter;
use crate::media::MediaKind;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-session state owned by the registry
#[derive(Clone)]
pub struct PeerState {
    /// Local audio track the relay writes into
    pub audio: SharedWriter,

    /// Local video track the relay writes into
    pub video: SharedWriter,

    /// Scope of the session's negotiation, keyframe and inbound relay tasks
    pub cancel: CancellationToken,
}

impl PeerState {
    pub fn track(&self, kind: MediaKind) -> &SharedWriter {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }
}

impl std::fmt::Debug for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerState")
            .field("audio", &self.audio.id())
            .field("video", &self.video.id())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Outcome of [`PeerRegistry::remove`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    /// Whether the id was registered
    pub removed: bool,

    /// Peers left after the removal
    pub remaining: usize,
}

impl Removal {
    /// True when this call removed the last peer
    pub fn emptied(&self) -> bool {
        self.removed && self.remaining == 0
    }
}

/// Session id → [`PeerState`] behind one mutex
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerState>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicatePeer`] if the id is already registered; the
    /// existing entry is left untouched.
    pub fn register(&self, id: &str, state: PeerState) -> Result<usize> {
        self.register_with(id, state, |count| count)
    }

    /// Register a peer and run `then` with the new peer count before the lock
    /// is released.
    ///
    /// Used to start the capture pipelines atomically with the registration.
    pub fn register_with<R>(
        &self,
        id: &str,
        state: PeerState,
        then: impl FnOnce(usize) -> R,
    ) -> Result<R> {
        let mut peers = self.peers.lock();
        if peers.contains_key(id) {
            return Err(Error::DuplicatePeer(id.to_string()));
        }

        peers.insert(id.to_string(), state);
        let count = peers.len();
        info!(session_id = %id, peers = count, "Registered peer");
        Ok(then(count))
    }

    /// Remove a peer
    pub fn remove(&self, id: &str) -> Removal {
        self.remove_with(id, |_| ())
    }

    /// Remove a peer and, if it was present, run `then` with the remaining
    /// count before the lock is released.
    ///
    /// Used to stop the capture pipelines atomically with the last removal.
    pub fn remove_with(&self, id: &str, then: impl FnOnce(usize)) -> Removal {
        let mut peers = self.peers.lock();
        let removed = peers.remove(id).is_some();
        let remaining = peers.len();

        if removed {
            info!(session_id = %id, peers = remaining, "Removed peer");
            then(remaining);
        } else {
            debug!(session_id = %id, "Peer already removed");
        }

        Removal { removed, remaining }
    }

    /// Copy of every entry, taken under the lock
    pub fn snapshot(&self) -> Vec<(String, PeerState)> {
        self.peers
            .lock()
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect()
    }

    /// Apply `f` to every peer. The entries are copied first and `f` runs
    /// without the lock held, so it may block or touch the registry.
    ///
    /// The fan-out relay walks the registry this way once per sample.
    pub fn for_each(&self, mut f: impl FnMut(&str, &PeerState)) {
        for (id, state) in self.snapshot() {
            f(&id, &state);
        }
    }

    pub fn get(&self, id: &str) -> Option<PeerState> {
        self.peers.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
