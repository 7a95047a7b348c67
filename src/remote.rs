//! HTTP implementations of the remote store and connectivity probe.
//!
//! The backend speaks JSON over REST:
//!
//! - `GET|PUT|DELETE /entities/{kind}/{id}`
//! - `POST /users/{user_id}/history`
//! - `POST /users/{user_id}/exports` returning `{"url": ...}`
//! - `POST /users/{user_id}/backups`, `GET /users/{user_id}/backups/latest`
//! - `GET /health`
//!
//! A 409 on save carries the newer remote record; 400 and 422 carry
//! `{"field", "message"}`.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use eunio_core::models::EntityKind;
use eunio_core::store::{
    BackupRecord, Connectivity, EntityRecord, HistoryRecord, NetworkType, RemoteError,
    RemoteStore,
};

use crate::config::SyncConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct RejectionBody {
    field: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportLink {
    url: String,
}

/// Joins a base URL and a path without doubling slashes.
fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn network(e: reqwest::Error) -> RemoteError {
    RemoteError::Network(e.to_string())
}

/// Maps an unsuccessful response status to a remote error.
///
/// Server-side and throttling failures are transient; other client errors
/// are rejections.
fn classify_failure(status: StatusCode, body: &str) -> RemoteError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return RemoteError::Network(format!("Server returned status {}", status));
    }

    let rejection: Option<RejectionBody> = serde_json::from_str(body).ok();
    let (field, message) = match rejection {
        Some(RejectionBody { field, message }) => (field, message),
        None => (None, None),
    };
    RemoteError::Rejected {
        field: field.unwrap_or_else(|| "request".to_string()),
        message: message.unwrap_or_else(|| format!("Server returned status {}", status)),
    }
}

/// Remote store backed by the sync server's REST API.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    server_url: String,
    api_key: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(server_url: impl Into<String>, api_key: Option<String>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(network)?;
        Ok(Self {
            client,
            server_url: server_url.into(),
            api_key,
        })
    }

    /// Returns `None` when no server is configured.
    pub fn from_config(config: &SyncConfig) -> Result<Option<Self>, RemoteError> {
        match &config.server_url {
            Some(url) => Self::new(url.clone(), config.api_key.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.server_url, path)
    }

    fn entity_url(&self, kind: EntityKind, id: &str) -> String {
        self.url(&format!("/entities/{}/{}", kind, id))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        self.authorize(request).send().await.map_err(network)
    }

    async fn expect_success(&self, response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, RemoteError> {
        let response = self.send(self.client.get(self.entity_url(kind, id))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.expect_success(response).await?;
        response.json().await.map(Some).map_err(network)
    }

    async fn save(&self, record: &EntityRecord) -> Result<(), RemoteError> {
        let request = self
            .client
            .put(self.entity_url(record.kind, &record.id))
            .json(record);
        let response = self.send(request).await?;

        if response.status() == StatusCode::CONFLICT {
            let remote: EntityRecord = response.json().await.map_err(network)?;
            return Err(RemoteError::Conflict {
                id: record.id.clone(),
                remote: Box::new(remote),
            });
        }
        self.expect_success(response).await?;
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        let response = self
            .send(self.client.delete(self.entity_url(kind, id)))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        self.expect_success(response).await?;
        Ok(())
    }

    async fn create_history_record(&self, record: HistoryRecord) -> Result<(), RemoteError> {
        let url = self.url(&format!("/users/{}/history", record.user_id));
        let response = self.send(self.client.post(url).json(&record)).await?;
        self.expect_success(response).await?;
        Ok(())
    }

    async fn create_shareable_export(
        &self,
        user_id: &str,
        payload: &str,
    ) -> Result<String, RemoteError> {
        let url = self.url(&format!("/users/{}/exports", user_id));
        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_string());
        let response = self.expect_success(self.send(request).await?).await?;
        let link: ExportLink = response.json().await.map_err(network)?;
        Ok(link.url)
    }

    async fn upload_backup(&self, record: &BackupRecord) -> Result<(), RemoteError> {
        let url = self.url(&format!("/users/{}/backups", record.user_id));
        let response = self.send(self.client.post(url).json(record)).await?;
        self.expect_success(response).await?;
        Ok(())
    }

    async fn latest_backup(&self, user_id: &str) -> Result<Option<BackupRecord>, RemoteError> {
        let url = self.url(&format!("/users/{}/backups/latest", user_id));
        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.expect_success(response).await?;
        response.json().await.map(Some).map_err(network)
    }
}

/// Stand-in used when no sync server is configured.
pub struct OfflineRemoteStore;

impl OfflineRemoteStore {
    fn unavailable() -> RemoteError {
        RemoteError::Network("sync server not configured".to_string())
    }
}

#[async_trait]
impl RemoteStore for OfflineRemoteStore {
    async fn get(&self, _kind: EntityKind, _id: &str) -> Result<Option<EntityRecord>, RemoteError> {
        Err(Self::unavailable())
    }

    async fn save(&self, _record: &EntityRecord) -> Result<(), RemoteError> {
        Err(Self::unavailable())
    }

    async fn delete(&self, _kind: EntityKind, _id: &str) -> Result<(), RemoteError> {
        Err(Self::unavailable())
    }

    async fn create_history_record(&self, _record: HistoryRecord) -> Result<(), RemoteError> {
        Err(Self::unavailable())
    }

    async fn create_shareable_export(
        &self,
        _user_id: &str,
        _payload: &str,
    ) -> Result<String, RemoteError> {
        Err(Self::unavailable())
    }

    async fn upload_backup(&self, _record: &BackupRecord) -> Result<(), RemoteError> {
        Err(Self::unavailable())
    }

    async fn latest_backup(&self, _user_id: &str) -> Result<Option<BackupRecord>, RemoteError> {
        Err(Self::unavailable())
    }
}

/// Reachability judged by the sync server's health endpoint.
#[derive(Clone)]
pub struct HttpConnectivity {
    client: reqwest::Client,
    health_url: String,
    metered: bool,
    poll_interval: Duration,
}

impl HttpConnectivity {
    pub fn new(server_url: &str, metered: bool) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .map_err(network)?;
        Ok(Self {
            client,
            health_url: join_url(server_url, "/health"),
            metered,
            poll_interval: Duration::from_secs(15),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn probe(client: &reqwest::Client, url: &str) -> bool {
        match client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl Connectivity for HttpConnectivity {
    async fn is_connected(&self) -> bool {
        Self::probe(&self.client, &self.health_url).await
    }

    async fn network_type(&self) -> NetworkType {
        if !self.is_connected().await {
            NetworkType::None
        } else if self.metered {
            NetworkType::Cellular
        } else {
            NetworkType::Wifi
        }
    }

    fn observe_connectivity(&self) -> BoxStream<'static, bool> {
        let probe = self.clone();
        stream::unfold((probe, true), |(probe, first)| async move {
            if !first {
                tokio::time::sleep(probe.poll_interval).await;
            }
            let online = Self::probe(&probe.client, &probe.health_url).await;
            Some((online, (probe, false)))
        })
        .boxed()
    }
}
