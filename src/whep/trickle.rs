//! Local candidate queue and trickle PATCH batching

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::sdp::{generate_sdp_fragment, OfferDescriptor};
use super::signaling::{IceCandidate, WhepSignaling};
use crate::error::Result;

/// Where a freshly gathered candidate goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateRoute {
    /// No session yet; held until the answer is applied
    Queued,
    /// Session exists; send it on its own
    SendNow(IceCandidate),
    /// Belongs to a peer that was already torn down
    Stale,
}

#[derive(Debug, Default)]
struct TrickleState {
    generation: u64,
    session_url: Option<String>,
    offer: OfferDescriptor,
    queue: Vec<IceCandidate>,
}

/// Per-client trickle state: session URL, offer descriptor and the queue of
/// candidates gathered before the session existed.
///
/// Shared between the peer's candidate callback and the client task. Every
/// operation carries the peer generation so that a torn-down peer cannot
/// touch the state of its successor.
#[derive(Clone)]
pub struct CandidateTrickle {
    signaling: WhepSignaling,
    state: Arc<Mutex<TrickleState>>,
    /// Serializes PATCH requests so fragments reach the server in order
    flush_lock: Arc<tokio::sync::Mutex<()>>,
}

impl CandidateTrickle {
    pub fn new(signaling: WhepSignaling) -> Self {
        Self {
            signaling,
            state: Arc::new(Mutex::new(TrickleState::default())),
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Drop session, offer and queue, and start tracking `generation`
    pub fn reset(&self, generation: u64) {
        let mut state = self.state.lock();
        *state = TrickleState {
            generation,
            ..Default::default()
        };
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn set_offer(&self, generation: u64, offer: OfferDescriptor) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.offer = offer;
        }
    }

    pub fn set_session_url(&self, generation: u64, session_url: String) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.session_url = Some(session_url);
        }
    }

    pub fn session_url(&self) -> Option<String> {
        self.state.lock().session_url.clone()
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Queue the candidate or hand it back for immediate sending
    pub fn route(&self, generation: u64, candidate: IceCandidate) -> CandidateRoute {
        let mut state = self.state.lock();
        if state.generation != generation {
            trace!("Dropping candidate of stale generation {}", generation);
            return CandidateRoute::Stale;
        }

        if state.session_url.is_none() {
            debug!("Queueing local candidate: {}", candidate.candidate);
            state.queue.push(candidate);
            CandidateRoute::Queued
        } else {
            CandidateRoute::SendNow(candidate)
        }
    }

    /// Move the queued candidates out; the queue is empty afterwards
    pub fn take_queued(&self, generation: u64) -> Vec<IceCandidate> {
        let mut state = self.state.lock();
        if state.generation != generation {
            return Vec::new();
        }
        std::mem::take(&mut state.queue)
    }

    /// PATCH `candidates` to the current session as one fragment.
    ///
    /// Returns how many were sent; zero when there was nothing to send, no
    /// session, or the generation went stale while waiting for the lock.
    pub async fn flush(&self, generation: u64, candidates: Vec<IceCandidate>) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }

        let _guard = self.flush_lock.lock().await;

        let (session_url, fragment) = {
            let state = self.state.lock();
            if state.generation != generation {
                return Ok(0);
            }
            let Some(session_url) = state.session_url.clone() else {
                return Ok(0);
            };
            (session_url, generate_sdp_fragment(&state.offer, &candidates))
        };

        self.signaling.send_candidates(&session_url, &fragment).await?;
        debug!(
            session_url = %session_url,
            count = candidates.len(),
            "Sent local candidates"
        );
        Ok(candidates.len())
    }
}
