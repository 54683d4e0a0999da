//! Workshop metadata client: form-encoded POST to the published-file
//! details endpoint, with retry on transient failures.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use modsync_config::SteamConfig;
use modsync_core::ModMetadata;

pub const DEFAULT_ENDPOINT: &str =
    "https://api.steampowered.com/ISteamRemoteStorage/GetPublishedFileDetails/v1/";

#[derive(Debug, thiserror::Error)]
pub enum WorkshopError {
    #[error("metadata request failed: {0}")]
    Transport(String),
    #[error("metadata endpoint returned status {0}")]
    Status(u16),
    #[error("metadata response parse failed: {0}")]
    Parse(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl WorkshopError {
    /// Transient failures are retried; everything else fails the attempt
    /// outright. `429` is the one status worth retrying.
    fn is_retryable(&self) -> bool {
        match self {
            WorkshopError::Transport(_) => true,
            WorkshopError::Status(code) => *code == 429 || *code >= 500,
            WorkshopError::Parse(_) | WorkshopError::Cancelled => false,
        }
    }
}

/// The one capability the workshop poller needs.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn fetch_metadata(
        &self,
        cancel: &CancellationToken,
        ids: &[String],
    ) -> Result<HashMap<String, ModMetadata>, WorkshopError>;
}

pub struct WebApiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    max_retries: u32,
    backoff: Duration,
}

impl WebApiClient {
    pub fn new(steam: &SteamConfig) -> Result<Self, WorkshopError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(steam.workshop_http_timeout_seconds))
            .build()
            .map_err(|e| WorkshopError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: steam.web_api_key.clone(),
            max_retries: steam.workshop_max_retries.max(1),
            backoff: Duration::from_millis(steam.workshop_backoff_millis),
        })
    }

    /// Point the client at a different endpoint; tests use this against a
    /// local fake.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn form_body(&self, ids: &[String]) -> Vec<(String, String)> {
        let mut form = Vec::with_capacity(ids.len() + 2);
        if let Some(key) = &self.api_key {
            form.push(("key".to_string(), key.clone()));
        }
        form.push(("itemcount".to_string(), ids.len().to_string()));
        for (i, id) in ids.iter().enumerate() {
            form.push((format!("publishedfileids[{i}]"), id.clone()));
        }
        form
    }

    async fn fetch_once(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ModMetadata>, WorkshopError> {
        let response = self
            .http
            .post(&self.endpoint)
            .form(&self.form_body(ids))
            .send()
            .await
            .map_err(|e| WorkshopError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkshopError::Status(status.as_u16()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| WorkshopError::Transport(e.to_string()))?;
        parse_metadata_response(&body)
    }
}

#[async_trait]
impl MetadataClient for WebApiClient {
    async fn fetch_metadata(
        &self,
        cancel: &CancellationToken,
        ids: &[String],
    ) -> Result<HashMap<String, ModMetadata>, WorkshopError> {
        let mut last_err = WorkshopError::Transport("no attempts made".to_string());
        for attempt in 1..=self.max_retries {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(WorkshopError::Cancelled),
                result = self.fetch_once(ids) => result,
            };
            match result {
                Ok(metadata) => return Ok(metadata),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    warn!(attempt, error = %e, "workshop metadata fetch failed, retrying");
                    let sleep = self.backoff * attempt;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(WorkshopError::Cancelled),
                        _ = tokio::time::sleep(sleep) => {}
                    }
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    response: ApiResponse,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    publishedfiledetails: Vec<ApiDetails>,
}

#[derive(Debug, Deserialize)]
struct ApiDetails {
    publishedfileid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    time_updated: i64,
}

/// Decode the published-file details payload. Entries without a usable
/// update time are dropped; the poller treats them as "no value returned".
pub fn parse_metadata_response(
    body: &[u8],
) -> Result<HashMap<String, ModMetadata>, WorkshopError> {
    let envelope: ApiEnvelope =
        serde_json::from_slice(body).map_err(|e| WorkshopError::Parse(e.to_string()))?;
    let mut out = HashMap::new();
    for details in envelope.response.publishedfiledetails {
        let Some(updated_at) = Utc.timestamp_opt(details.time_updated, 0).single() else {
            continue;
        };
        if details.time_updated == 0 {
            continue;
        }
        out.insert(
            details.publishedfileid.clone(),
            ModMetadata {
                id: details.publishedfileid,
                title: details.title,
                updated_at,
            },
        );
    }
    Ok(out)
}
