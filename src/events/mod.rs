//! Event bus for client notifications
//!
//! A running client publishes its state changes, session lifecycle and
//! trickle progress here; the CLI and tests subscribe.

pub mod types;

pub use types::WhepEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts client events to every subscriber
///
/// # Example
///
/// ```no_run
/// use mediamtx_whep::events::{EventBus, WhepEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(WhepEvent::SessionCreated {
///     session_url: "/api/mediamtx/sessions/abc".to_string(),
/// });
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("Received event: {:?}", event);
///     }
/// });
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WhepEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Dropped silently when nobody listens.
    pub fn publish(&self, event: WhepEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls too far behind receives `Lagged` and misses
    /// some events.
    pub fn subscribe(&self) -> broadcast::Receiver<WhepEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
