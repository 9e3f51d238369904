//! Connection and client state names

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

/// Mirror of the ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// States in which a remote answer must not be applied again
    pub fn is_connected_like(self) -> bool {
        matches!(
            self,
            IceState::New | IceState::Checking | IceState::Connected | IceState::Completed
        )
    }

    /// States that trigger a full restart
    pub fn is_disconnected_like(self) -> bool {
        matches!(
            self,
            IceState::Disconnected | IceState::Failed | IceState::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IceState::New => "new",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Completed => "completed",
            IceState::Disconnected => "disconnected",
            IceState::Failed => "failed",
            IceState::Closed => "closed",
        }
    }

    /// Convert from the peer connection's state; `Unspecified` is not readable yet
    pub fn from_rtc(state: RTCIceConnectionState) -> Option<Self> {
        match state {
            RTCIceConnectionState::New => Some(IceState::New),
            RTCIceConnectionState::Checking => Some(IceState::Checking),
            RTCIceConnectionState::Connected => Some(IceState::Connected),
            RTCIceConnectionState::Completed => Some(IceState::Completed),
            RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
            RTCIceConnectionState::Failed => Some(IceState::Failed),
            RTCIceConnectionState::Closed => Some(IceState::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for IceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Phase of the client state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    /// Created, not started
    Idle,
    /// Discovering ICE servers and building the peer connection
    Bootstrapping,
    /// Posting the local offer
    Offering,
    /// Applying the answer and flushing queued candidates
    Negotiating,
    /// Session established, candidates trickle as they are found
    Trickling,
    /// ICE reported connected or completed
    Connected,
    /// A failure was seen; waiting before restart
    Disconnected,
    /// Tearing down before bootstrapping again
    Restarting,
    /// The retry policy declined to restart; only a manual restart revives it
    Halted,
    /// Stopped for good
    Stopped,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientState::Idle => "idle",
            ClientState::Bootstrapping => "bootstrapping",
            ClientState::Offering => "offering",
            ClientState::Negotiating => "negotiating",
            ClientState::Trickling => "trickling",
            ClientState::Connected => "connected",
            ClientState::Disconnected => "disconnected",
            ClientState::Restarting => "restarting",
            ClientState::Halted => "halted",
            ClientState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_sets_are_disjoint() {
        let all = [
            IceState::New,
            IceState::Checking,
            IceState::Connected,
            IceState::Completed,
            IceState::Disconnected,
            IceState::Failed,
            IceState::Closed,
        ];
        for state in all {
            assert_ne!(state.is_connected_like(), state.is_disconnected_like(), "{}", state);
        }
    }

    #[test]
    fn test_from_rtc() {
        assert_eq!(IceState::from_rtc(RTCIceConnectionState::Unspecified), None);
        assert_eq!(
            IceState::from_rtc(RTCIceConnectionState::Failed),
            Some(IceState::Failed)
        );
        assert_eq!(IceState::Completed.to_string(), "completed");
    }
}
