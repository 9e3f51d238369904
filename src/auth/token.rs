use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, ConfigStore};
use crate::error::{AppError, Result};

/// Remaining lifetime below which the token is considered expired (ms)
const EXPIRED_MARGIN_MS: i64 = 10_000;

/// Remaining lifetime below which a background refresh is started (ms)
const PASSIVE_REFRESH_MS: i64 = 60_000;

/// Source of bearer tokens for the signaling requests
///
/// Called before every authenticated request. Returns an empty string when
/// no token is available; the request is still sent.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> String;
}

/// A fixed token
#[derive(Debug, Clone, Default)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> String {
        self.0.clone()
    }
}

/// What to do with the cached token at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// No expiry known: there is no usable token
    NoToken,
    /// Valid for a while
    Fresh,
    /// Still valid, refresh in the background
    Passive,
    /// Expired, refresh before use
    Blocking,
}

impl RefreshPlan {
    pub fn at(expires: Option<i64>, now_ms: i64) -> Self {
        let Some(expires) = expires else {
            return RefreshPlan::NoToken;
        };

        let remaining = expires - now_ms;
        if remaining > EXPIRED_MARGIN_MS {
            if remaining < PASSIVE_REFRESH_MS {
                RefreshPlan::Passive
            } else {
                RefreshPlan::Fresh
            }
        } else {
            RefreshPlan::Blocking
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Token cache renewed through the host's `/auth/token` endpoint
///
/// Refreshes are single-flight: concurrent callers share one request.
#[derive(Clone)]
pub struct RefreshingToken {
    inner: Arc<RefreshInner>,
}

struct RefreshInner {
    client: reqwest::Client,
    token_url: Url,
    data: RwLock<AuthConfig>,
    refreshing: Mutex<()>,
    store: Option<ConfigStore>,
}

impl RefreshingToken {
    pub fn new(origin: &str, data: AuthConfig) -> Result<Self> {
        Self::build(origin, data, None)
    }

    /// Like `new`, persisting refreshed tokens to the configuration file
    pub fn with_store(origin: &str, data: AuthConfig, store: ConfigStore) -> Result<Self> {
        Self::build(origin, data, Some(store))
    }

    fn build(origin: &str, data: AuthConfig, store: Option<ConfigStore>) -> Result<Self> {
        let token_url = Url::parse(origin)
            .and_then(|o| o.join("/auth/token"))
            .map_err(|e| AppError::Config(format!("Invalid origin '{}': {}", origin, e)))?;

        Ok(Self {
            inner: Arc::new(RefreshInner {
                client: reqwest::Client::new(),
                token_url,
                data: RwLock::new(data),
                refreshing: Mutex::new(()),
                store,
            }),
        })
    }

    /// Current cached token data
    pub fn data(&self) -> AuthConfig {
        self.inner.data.read().clone()
    }

    /// Refresh the token, or wait for a refresh already in flight
    pub async fn refresh(&self) -> Result<()> {
        let seen = self.inner.data.read().expires;
        let _guard = self.inner.refreshing.lock().await;

        // Someone else refreshed while we waited for the lock
        if self.inner.data.read().expires != seen {
            return Ok(());
        }

        self.do_refresh().await
    }

    async fn do_refresh(&self) -> Result<()> {
        let (refresh_token, client_id) = {
            let data = self.inner.data.read();
            (
                data.refresh_token.clone().unwrap_or_default(),
                data.client_id.clone().unwrap_or_default(),
            )
        };

        debug!("Refreshing access token via {}", self.inner.token_url);
        let resp = self
            .inner
            .client
            .post(self.inner.token_url.clone())
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", client_id.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(AppError::unexpected_status(
                "POST",
                self.inner.token_url.as_str(),
                status,
            ));
        }

        let body = resp.text().await?;
        let token: TokenResponse = serde_json::from_str(&body)?;
        let updated = {
            let mut data = self.inner.data.write();
            merge_token(&mut data, token, Utc::now().timestamp_millis());
            data.clone()
        };
        info!("Access token refreshed");

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.update(|c| c.auth = updated).await {
                warn!("Failed to persist refreshed token: {}", e);
            }
        }

        Ok(())
    }

    fn spawn_passive_refresh(&self) {
        // A refresh is already running
        if self.inner.refreshing.try_lock().is_err() {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.refresh().await {
                warn!("Background token refresh failed: {}", e);
            }
        });
    }
}

fn merge_token(data: &mut AuthConfig, token: TokenResponse, now_ms: i64) {
    data.access_token = token.access_token;
    if let Some(expires_in) = token.expires_in {
        data.expires = Some(now_ms + expires_in * 1000);
    }
    if token.refresh_token.is_some() {
        data.refresh_token = token.refresh_token;
    }
}

#[async_trait]
impl TokenProvider for RefreshingToken {
    async fn access_token(&self) -> String {
        let expires = self.inner.data.read().expires;

        match RefreshPlan::at(expires, Utc::now().timestamp_millis()) {
            RefreshPlan::NoToken => return String::new(),
            RefreshPlan::Fresh => {}
            RefreshPlan::Passive => self.spawn_passive_refresh(),
            RefreshPlan::Blocking => {
                if let Err(e) = self.refresh().await {
                    warn!("Error refreshing access token: {}", e);
                }
            }
        }

        self.inner.data.read().access_token.clone()
    }
}
