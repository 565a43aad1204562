//! HTTP connector: token fetch and batch upload against the backend API.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{config::SyncConfig, mutation::UploadBatch};

use super::{Transport, TransportError, token::TokenManager};

const TOKEN_PATH: &str = "/api/auth/token";
const DATA_PATH: &str = "/api/data";

/// Body returned by the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Bearer token.
    pub token: String,
    /// Lifetime in seconds, if the backend reports one.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Endpoint and token a sync client connects with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Sync service URL.
    pub endpoint: String,
    /// Bearer token.
    pub token: String,
}

/// [`Transport`] over the backend's JSON API.
#[derive(Debug)]
pub struct HttpConnector {
    client: reqwest::Client,
    backend_url: String,
    sync_url: String,
    tokens: Mutex<TokenManager>,
    default_lifetime: Duration,
    refresh_buffer: Duration,
}

impl HttpConnector {
    /// Builds a connector with the configured timeout and endpoints.
    pub fn new(config: &SyncConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(network_error)?;
        Ok(Self {
            client,
            backend_url: config.backend_url.trim_end_matches('/').to_string(),
            sync_url: config.sync_url.clone(),
            tokens: Mutex::new(TokenManager::new()),
            default_lifetime: Duration::from_secs(config.token_lifetime_secs),
            refresh_buffer: Duration::from_secs(config.token_refresh_buffer_secs),
        })
    }

    /// Fetches a fresh token and caches it.
    pub async fn fetch_credentials(&self) -> Result<Credentials, TransportError> {
        let url = format!("{}{TOKEN_PATH}", self.backend_url);
        let resp = self.client.get(&url).send().await.map_err(network_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Auth {
                reason: format!("token endpoint returned HTTP {}: {body}", status.as_u16()),
            });
        }

        let parsed: TokenResponse = resp.json().await.map_err(|e| TransportError::Auth {
            reason: format!("token response decode failed: {e}"),
        })?;
        let lifetime = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(self.default_lifetime);

        self.tokens.lock().await.store(parsed.token.clone(), lifetime);
        info!(lifetime_secs = lifetime.as_secs(), "fetched upload credentials");

        Ok(Credentials {
            endpoint: self.sync_url.clone(),
            token: parsed.token,
        })
    }

    /// Drops the cached token so the next upload fetches a new one.
    pub async fn invalidate_token(&self) {
        self.tokens.lock().await.clear();
    }

    async fn bearer_token(&self) -> Result<String, TransportError> {
        if let Some(token) = self.tokens.lock().await.get(self.refresh_buffer) {
            return Ok(token.to_string());
        }
        debug!("no valid token cached, fetching");
        Ok(self.fetch_credentials().await?.token)
    }

    async fn post_batch(
        &self,
        token: &str,
        batch: &UploadBatch,
    ) -> Result<(StatusCode, String), TransportError> {
        let url = format!("{}{DATA_PATH}", self.backend_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(batch)
            .send()
            .await
            .map_err(network_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(network_error)?;
        Ok((status, body))
    }
}

impl Transport for HttpConnector {
    async fn upload(&self, batch: &UploadBatch) -> Result<(), TransportError> {
        let token = self.bearer_token().await?;
        let (mut status, mut body) = self.post_batch(&token, batch).await?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), "upload unauthorized, refreshing token once");
            self.invalidate_token().await;
            let token = self.fetch_credentials().await?.token;
            (status, body) = self.post_batch(&token, batch).await?;
        }

        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(entries = batch.len(), status = status.as_u16(), "batch accepted");
        Ok(())
    }
}

fn network_error(err: reqwest::Error) -> TransportError {
    let reason = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        err.to_string()
    };
    TransportError::Network { reason }
}
