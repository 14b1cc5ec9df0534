//! Client side of the relay protocol: public-key directory and message pull.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ClientConfig;

pub const VAULT_HEADER: &str = "X-Vault-Id";

// ─── Wire types ───────────────────────────────────────────────────────────────

/// Body of `POST /publickey/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub user_id: String,
    pub vault_id: String,
    pub public_key: String,
    pub key_id: String,
}

/// Body of a successful `GET /publickey/:userId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    pub user_id: String,
    pub public_key: String,
    pub key_id: String,
    pub registered_at: i64,
}

/// Body of `POST /messages/update-sync-status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusUpdate {
    pub vault_id: String,
    pub user_id: String,
    pub message_ids: Vec<String>,
}

// ─── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("not found")]
    NotFound,
    #[error("relay answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed relay response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            NetworkError::Decode(e.to_string())
        } else {
            NetworkError::Transport(e.to_string())
        }
    }
}

// ─── RelayClient ──────────────────────────────────────────────────────────────

/// Everything the client asks of its relay.
pub trait RelayClient: Send + Sync {
    fn register_public_key(
        &self,
        request: &RegisterRequest,
    ) -> impl Future<Output = Result<(), NetworkError>> + Send;

    /// `NetworkError::NotFound` when the relay has no key for `user_id`.
    fn fetch_public_key(
        &self,
        user_id: &str,
        vault_id: &str,
    ) -> impl Future<Output = Result<PublicKeyResponse, NetworkError>> + Send;

    fn fetch_messages(
        &self,
        vault_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<Value>, NetworkError>> + Send;

    /// Returns how many records the relay flagged.
    fn mark_synced(
        &self,
        update: &SyncStatusUpdate,
    ) -> impl Future<Output = Result<u64, NetworkError>> + Send;
}

impl<T: RelayClient> RelayClient for std::sync::Arc<T> {
    fn register_public_key(
        &self,
        request: &RegisterRequest,
    ) -> impl Future<Output = Result<(), NetworkError>> + Send {
        (**self).register_public_key(request)
    }

    fn fetch_public_key(
        &self,
        user_id: &str,
        vault_id: &str,
    ) -> impl Future<Output = Result<PublicKeyResponse, NetworkError>> + Send {
        (**self).fetch_public_key(user_id, vault_id)
    }

    fn fetch_messages(
        &self,
        vault_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<Value>, NetworkError>> + Send {
        (**self).fetch_messages(vault_id, user_id)
    }

    fn mark_synced(
        &self,
        update: &SyncStatusUpdate,
    ) -> impl Future<Output = Result<u64, NetworkError>> + Send {
        (**self).mark_synced(update)
    }
}

/// reqwest-backed [`RelayClient`].
#[derive(Debug, Clone)]
pub struct HttpRelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRelayClient {
    pub fn new(config: &ClientConfig) -> Result<Self, NetworkError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("notebridge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { http, base_url: config.base_url().to_string() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check(res: reqwest::Response) -> Result<reqwest::Response, NetworkError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(NetworkError::NotFound);
    }
    let body = res.text().await.unwrap_or_default();
    Err(NetworkError::Status { status: status.as_u16(), body })
}

impl RelayClient for HttpRelayClient {
    async fn register_public_key(&self, request: &RegisterRequest) -> Result<(), NetworkError> {
        let res = self
            .http
            .post(self.url("/publickey/register"))
            .json(request)
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    async fn fetch_public_key(
        &self,
        user_id: &str,
        vault_id: &str,
    ) -> Result<PublicKeyResponse, NetworkError> {
        let res = self
            .http
            .get(self.url(&format!("/publickey/{user_id}")))
            .header(VAULT_HEADER, vault_id)
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }

    async fn fetch_messages(&self, vault_id: &str, user_id: &str) -> Result<Vec<Value>, NetworkError> {
        let res = self
            .http
            .get(self.url(&format!("/messages/{vault_id}/{user_id}")))
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }

    async fn mark_synced(&self, update: &SyncStatusUpdate) -> Result<u64, NetworkError> {
        let res = self
            .http
            .post(self.url("/messages/update-sync-status"))
            .json(update)
            .send()
            .await?;
        let body: Value = check(res).await?.json().await?;
        body.get("updated")
            .and_then(Value::as_u64)
            .ok_or_else(|| NetworkError::Decode("missing `updated` count".into()))
    }
}
