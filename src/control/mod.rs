//! Cross-frame control protocol
//!
//! The dashboard widget drives the embedded viewer with small
//! `{ "key": ..., "value": ... }` messages. Delivery is same-origin only;
//! a target that is not ready yet is retried a few times.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::whep::WhepHandle;

/// Delay between delivery attempts while the target is not ready
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retries after the first attempt
pub const MAX_RETRIES: u32 = 3;

/// A control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key", content = "value", rename_all = "lowercase", deny_unknown_fields)]
pub enum ControlMessage {
    Fullscreen(bool),
    Mute(bool),
    /// Only `true` triggers a restart
    Restart(bool),
}

impl ControlMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text.trim())?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A message together with the origin it was posted for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message: ControlMessage,
    pub origin: String,
}

/// The embedded frame messages are posted to
#[async_trait]
pub trait FrameTarget: Send + Sync {
    /// Whether the frame can receive messages yet
    fn is_ready(&self) -> bool;

    async fn deliver(&self, envelope: Envelope) -> Result<()>;
}

/// Posts messages to a frame on its own origin
pub struct ControlSender {
    origin: String,
    target: Arc<dyn FrameTarget>,
}

impl ControlSender {
    pub fn new(origin: impl Into<String>, target: Arc<dyn FrameTarget>) -> Self {
        Self {
            origin: origin.into(),
            target,
        }
    }

    /// Deliver `message`, waiting for the target to become ready.
    ///
    /// Returns `false` when the target was still not ready after
    /// `MAX_RETRIES` retries; the message is dropped in that case.
    pub async fn post(&self, message: ControlMessage) -> Result<bool> {
        let mut attempt = 0;
        loop {
            if self.target.is_ready() {
                self.target
                    .deliver(Envelope {
                        message,
                        origin: self.origin.clone(),
                    })
                    .await?;
                return Ok(true);
            }

            if attempt >= MAX_RETRIES {
                debug!("Frame not ready, dropping {:?}", message);
                return Ok(false);
            }
            attempt += 1;
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
}

/// In-process frame: ready once a receiver is attached
#[derive(Default)]
pub struct ChannelTarget {
    tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
}

impl ChannelTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a receiving end; the target becomes ready
    pub fn attach(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock() = Some(tx);
        rx
    }
}

#[async_trait]
impl FrameTarget for ChannelTarget {
    fn is_ready(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        let tx = self.tx.lock().clone();
        tx.ok_or_else(|| AppError::ChannelClosed("frame not attached".to_string()))?
            .send(envelope)
            .map_err(|_| AppError::ChannelClosed("frame receiver dropped".to_string()))
    }
}

/// Presentation state of the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewState {
    pub fullscreen: bool,
    pub muted: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            fullscreen: false,
            muted: true,
        }
    }
}

/// Something a `restart` message can restart
pub trait RestartTarget: Send + Sync {
    fn request_restart(&self) -> Result<()>;
}

impl RestartTarget for WhepHandle {
    fn request_restart(&self) -> Result<()> {
        self.restart()
    }
}

/// Applies control messages on the viewer side
pub struct ControlReceiver {
    origin: String,
    view: watch::Sender<ViewState>,
    client: Arc<dyn RestartTarget>,
}

impl ControlReceiver {
    pub fn new(origin: impl Into<String>, client: Arc<dyn RestartTarget>) -> Self {
        let (view, _) = watch::channel(ViewState::default());
        Self {
            origin: origin.into(),
            view,
            client,
        }
    }

    pub fn view(&self) -> ViewState {
        *self.view.borrow()
    }

    pub fn watch_view(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }

    /// Apply one message; messages for another origin are ignored
    pub fn handle(&self, envelope: Envelope) -> Result<()> {
        if envelope.origin != self.origin {
            debug!("Ignoring control message for origin {}", envelope.origin);
            return Ok(());
        }

        match envelope.message {
            ControlMessage::Fullscreen(on) => {
                self.view.send_modify(|view| {
                    view.fullscreen = on;
                    // entering fullscreen turns the sound on
                    if on {
                        view.muted = false;
                    }
                });
            }
            ControlMessage::Mute(muted) => {
                self.view.send_modify(|view| view.muted = muted);
            }
            ControlMessage::Restart(true) => {
                info!("Restart requested by control message");
                self.client.request_restart()?;
            }
            ControlMessage::Restart(false) => {}
        }
        Ok(())
    }

    /// Apply messages until the channel closes
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = self.handle(envelope) {
                warn!("Failed to apply control message: {}", e);
            }
        }
    }
}
