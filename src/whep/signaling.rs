//! WHEP signaling exchanges and their wire types

use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::transport::{HttpTransport, WhepRequest, WhepResponse};
use crate::auth::TokenProvider;
use crate::error::{AppError, Result};

/// Path prefix of the host's MediaMTX proxy; session URLs are relative to it
pub const API_PREFIX: &str = "/api/mediamtx";

pub const CONTENT_TYPE_SDP: &str = "application/sdp";
pub const CONTENT_TYPE_TRICKLE: &str = "application/trickle-ice-sdpfrag";
const CONTENT_TYPE_JSON: &str = "application/json";

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Answer to a posted offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhepAnswer {
    /// Session resource URL, already prefixed with `API_PREFIX`
    pub session_url: String,
    /// Raw SDP answer
    pub sdp: String,
}

/// Session URL of a `Location` header value
pub fn session_url_from_location(location: &str) -> String {
    format!("{}{}", API_PREFIX, location)
}

/// Bearer-authenticated WHEP requests with status checks
#[derive(Clone)]
pub struct WhepSignaling {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<dyn TokenProvider>,
}

impl WhepSignaling {
    pub fn new(transport: Arc<dyn HttpTransport>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { transport, tokens }
    }

    async fn authorized(&self, method: Method, url: &str) -> WhepRequest {
        let token = self.tokens.access_token().await;
        WhepRequest::new(method, url).header("Authorization", format!("Bearer {}", token))
    }

    async fn send(&self, request: WhepRequest) -> Result<WhepResponse> {
        self.transport.send(request).await
    }

    /// OPTIONS probe returning the raw `Link` header value, if any
    ///
    /// Several `Link` headers are joined with `", "`, the way a browser
    /// folds them.
    pub async fn request_ice_servers(&self, resource_url: &str) -> Result<Option<String>> {
        let url = format!("{}/whep", resource_url);
        info!("requesting ICE servers from {}", url);

        let request = self
            .authorized(Method::OPTIONS, &url)
            .await
            .header("Content-Type", CONTENT_TYPE_JSON);
        let resp = self.send(request).await?;

        if !resp.is_success() {
            return Err(AppError::unexpected_status("OPTIONS", &url, resp.status));
        }

        let links = resp.header_values("link");
        if links.is_empty() {
            debug!("No Link header in OPTIONS response");
            return Ok(None);
        }
        Ok(Some(links.join(", ")))
    }

    /// POST the offer; expects `201 Created` with a `Location` header
    pub async fn post_offer(&self, resource_url: &str, sdp: &str) -> Result<WhepAnswer> {
        let url = format!("{}/whep", resource_url);
        info!("sending offer to {}", url);

        let request = self
            .authorized(Method::POST, &url)
            .await
            .header("Content-Type", CONTENT_TYPE_SDP)
            .body(sdp);
        let resp = self.send(request).await?;

        if resp.status != 201 {
            return Err(AppError::unexpected_status("POST", &url, resp.status));
        }

        let location = resp
            .header("location")
            .ok_or_else(|| AppError::MissingHeader("Location".to_string()))?;
        let session_url = session_url_from_location(location);
        debug!("Session created: {}", session_url);

        Ok(WhepAnswer {
            session_url,
            sdp: resp.body,
        })
    }

    /// PATCH a trickle fragment to the session; expects `204 No Content`
    pub async fn send_candidates(&self, session_url: &str, fragment: &str) -> Result<()> {
        let request = self
            .authorized(Method::PATCH, session_url)
            .await
            .header("Content-Type", CONTENT_TYPE_TRICKLE)
            .header("If-Match", "*")
            .body(fragment);
        let resp = self.send(request).await?;

        if resp.status != 204 {
            return Err(AppError::unexpected_status("PATCH", session_url, resp.status));
        }
        Ok(())
    }

    /// DELETE the session resource; expects `200 OK`
    pub async fn delete_session(&self, session_url: &str) -> Result<()> {
        let request = self
            .authorized(Method::DELETE, session_url)
            .await
            .header("Content-Type", CONTENT_TYPE_JSON);
        let resp = self.send(request).await?;

        if resp.status != 200 {
            return Err(AppError::unexpected_status("DELETE", session_url, resp.status));
        }
        Ok(())
    }
}
