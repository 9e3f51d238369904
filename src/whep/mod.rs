//! WHEP viewer client
//!
//! Negotiates a receive-side WebRTC session with a MediaMTX server behind
//! the host's `/api/mediamtx` proxy:
//!
//! 1. `OPTIONS <endpoint>/<resource>/whep` for ICE servers (`Link` headers)
//! 2. Build the peer, create an offer, force stereo Opus
//! 3. `POST` the offer; `201` + `Location` names the session resource
//! 4. Apply the answer, then trickle local candidates with `PATCH`
//! 5. On failure: `DELETE` the session, wait, and start over
//!
//! Architecture:
//! ```text
//! WhepClient (FSM task)
//!     |-- WhepSignaling ---- HttpTransport (reqwest)
//!     |-- CandidateTrickle - queue / session URL / flush lock
//!     |-- PeerConnector ---- MediaPeer (webrtc)
//!     +-- ClientHooks ------ host callbacks
//! ```

pub mod client;
pub mod hooks;
pub mod link;
pub mod mdns;
pub mod peer;
pub mod sdp;
pub mod signaling;
pub mod state;
pub mod transport;
pub mod trickle;

pub use client::{WhepClient, WhepHandle};
pub use hooks::{max_restarts, ClientHooks, RetryContext, TrackEvent};
pub use link::{link_to_ice_servers, IceServerEntry};
pub use peer::{MediaPeer, PeerConnector, PeerObserver, RtcConnector, RtcPeer};
pub use sdp::{edit_offer, enable_stereo_opus, generate_sdp_fragment, parse_offer, OfferDescriptor};
pub use signaling::{IceCandidate, WhepAnswer, WhepSignaling, API_PREFIX};
pub use state::{ClientState, IceState};
pub use transport::{HttpTransport, ReqwestTransport, WhepRequest, WhepResponse};
pub use trickle::{CandidateRoute, CandidateTrickle};
