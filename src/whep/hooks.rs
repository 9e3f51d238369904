//! Host-supplied callbacks
//!
//! Each slot is independently optional; an unset slot falls back to the
//! built-in behaviour (ignore tracks, ignore states, always retry).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use webrtc::track::track_remote::TrackRemote;

use super::state::IceState;

/// A remote media track
#[derive(Clone)]
pub struct TrackEvent {
    /// "audio" or "video"
    pub kind: String,
    pub track_id: String,
    pub stream_id: String,
    /// Handle for reading RTP; absent for synthetic peers
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for TrackEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackEvent")
            .field("kind", &self.kind)
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// What the retry policy gets to look at
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// The failure being handled
    pub error: String,
    /// Restarts since the last time ICE reached connected
    pub attempt: u32,
    /// Last reported ICE state
    pub ice_state: Option<IceState>,
    /// Whether a peer connection currently exists
    pub has_peer: bool,
}

pub type TrackCallback = Arc<dyn Fn(TrackEvent) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type RetryCallback = Arc<dyn Fn(&RetryContext) -> bool + Send + Sync>;

/// Optional track / state / retry callbacks
#[derive(Clone, Default)]
pub struct ClientHooks {
    on_track: Option<TrackCallback>,
    on_connection_state: Option<StateCallback>,
    should_retry: Option<RetryCallback>,
}

impl ClientHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_track<F>(mut self, f: F) -> Self
    where
        F: Fn(TrackEvent) + Send + Sync + 'static,
    {
        self.on_track = Some(Arc::new(f));
        self
    }

    pub fn on_connection_state<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_connection_state = Some(Arc::new(f));
        self
    }

    pub fn should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&RetryContext) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(f));
        self
    }

    pub(crate) fn track(&self, event: TrackEvent) {
        if let Some(cb) = &self.on_track {
            cb(event);
        }
    }

    pub(crate) fn connection_state(&self, state: &str) {
        if let Some(cb) = &self.on_connection_state {
            cb(state);
        }
    }

    /// Without a policy every failure is retried
    pub(crate) fn retry(&self, ctx: &RetryContext) -> bool {
        match &self.should_retry {
            Some(cb) => cb(ctx),
            None => true,
        }
    }
}

/// Retry policy allowing at most `max` restarts in total
pub fn max_restarts(max: u32) -> impl Fn(&RetryContext) -> bool + Send + Sync + 'static {
    let used = AtomicU32::new(0);
    move |_ctx| used.fetch_add(1, Ordering::SeqCst) < max
}
