//! HTTP transport used by the WHEP signaling exchanges

use async_trait::async_trait;
use reqwest::{Method, Url};
use tracing::trace;

use crate::error::{AppError, Result};

/// An outgoing signaling request
///
/// `url` may be absolute or a path relative to the transport's origin
/// (session URLs handed out by the server are relative).
#[derive(Debug, Clone)]
pub struct WhepRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<String>,
}

impl WhepRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A received response, headers kept in arrival order with lowercase names
#[derive(Debug, Clone, Default)]
pub struct WhepResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl WhepResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).into_iter().next()
    }

    /// All values of a header, in order
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends signaling requests
///
/// A request that cannot be delivered at all is an `Err`; any HTTP status,
/// including error statuses, is an `Ok` response for the caller to judge.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: WhepRequest) -> Result<WhepResponse>;
}

/// `reqwest`-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
    origin: Url,
}

impl ReqwestTransport {
    /// Create a transport resolving relative URLs against `origin`
    pub fn new(origin: &str) -> Result<Self> {
        let origin = Url::parse(origin)
            .map_err(|e| AppError::Config(format!("Invalid origin '{}': {}", origin, e)))?;

        Ok(Self {
            client: reqwest::Client::new(),
            origin,
        })
    }

    /// Resolve an absolute or origin-relative URL
    pub fn resolve(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(url) => Ok(url),
            Err(_) => self
                .origin
                .join(url)
                .map_err(|e| AppError::Config(format!("Invalid URL '{}': {}", url, e))),
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: WhepRequest) -> Result<WhepResponse> {
        let url = self.resolve(&request.url)?;
        trace!("{} {}", request.method, url);

        let mut builder = self.client.request(request.method, url);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp.text().await?;

        Ok(WhepResponse {
            status,
            headers,
            body,
        })
    }
}
