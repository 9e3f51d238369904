use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{method} {url} returned unexpected status {status}")]
    Http {
        method: String,
        url: String,
        status: u16,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Missing header in response: {0}")]
    MissingHeader(String),

    #[error("Malformed Link header entry: {0}")]
    MalformedLink(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the reconnection handler may recover from this error.
    ///
    /// Network and peer failures are recoverable. Malformed input and
    /// configuration problems are not: retrying would only fail the same way.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::Http { .. }
                | AppError::Transport(_)
                | AppError::MissingHeader(_)
                | AppError::WebRtc(_)
                | AppError::Io(_)
        )
    }

    pub(crate) fn unexpected_status(method: &str, url: &str, status: u16) -> Self {
        AppError::Http {
            method: method.to_string(),
            url: url.to_string(),
            status,
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
