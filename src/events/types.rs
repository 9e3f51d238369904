//! Client event types
//!
//! Defines the notifications a running WHEP client broadcasts through the
//! event bus.

use serde::{Deserialize, Serialize};

use crate::whep::{ClientState, IceState};

/// WHEP client event enumeration
///
/// Serialized as
/// ```json
/// {
///   "event": "session.created",
///   "data": { "session_url": "/api/mediamtx/sessions/abc" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum WhepEvent {
    // ============================================================================
    // Client lifecycle
    // ============================================================================
    /// The state machine entered a new phase
    #[serde(rename = "client.state_changed")]
    ClientStateChanged { state: ClientState },

    /// A restart was scheduled after a failure
    #[serde(rename = "client.restart_scheduled")]
    RestartScheduled {
        /// Delay before teardown starts (milliseconds)
        delay_ms: u64,
        /// Error or state that caused it
        reason: String,
    },

    /// The retry policy declined to restart
    #[serde(rename = "client.halted")]
    Halted { reason: String },

    /// Bootstrap failed and the next endpoint will be used
    #[serde(rename = "client.endpoint_rotated")]
    EndpointRotated { index: usize, endpoint: String },

    // ============================================================================
    // Session
    // ============================================================================
    #[serde(rename = "session.created")]
    SessionCreated { session_url: String },

    #[serde(rename = "session.deleted")]
    SessionDeleted { session_url: String },

    // ============================================================================
    // ICE / media
    // ============================================================================
    #[serde(rename = "ice.state_changed")]
    IceStateChanged { state: IceState },

    /// A trickle PATCH was accepted
    #[serde(rename = "ice.candidates_sent")]
    CandidatesSent { session_url: String, count: usize },

    /// A remote track arrived
    #[serde(rename = "media.track")]
    TrackAdded {
        /// "audio" or "video"
        kind: String,
        track_id: String,
    },
}

impl WhepEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ClientStateChanged { .. } => "client.state_changed",
            Self::RestartScheduled { .. } => "client.restart_scheduled",
            Self::Halted { .. } => "client.halted",
            Self::EndpointRotated { .. } => "client.endpoint_rotated",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionDeleted { .. } => "session.deleted",
            Self::IceStateChanged { .. } => "ice.state_changed",
            Self::CandidatesSent { .. } => "ice.candidates_sent",
            Self::TrackAdded { .. } => "media.track",
        }
    }
}
