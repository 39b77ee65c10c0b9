//! HTTP client for the authoritative balance and job endpoints

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::RemoteConfig;

use super::SyncApi;
use super::error::{RemoteError, Result};
use super::models::{BalanceResponse, HealthStatus, JobScope, RefundRequest, ServerJob};

/// Server list responses come either bare or wrapped
#[derive(Deserialize)]
#[serde(untagged)]
enum JobsPayload {
    Bare(Vec<ServerJob>),
    Wrapped { jobs: Vec<ServerJob> },
}

impl From<JobsPayload> for Vec<ServerJob> {
    fn from(payload: JobsPayload) -> Self {
        match payload {
            JobsPayload::Bare(jobs) | JobsPayload::Wrapped { jobs } => jobs,
        }
    }
}

/// [`SyncApi`] over HTTP
pub struct HttpSyncApi {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpSyncApi {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| RemoteError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidUrl(config.base_url.clone()));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout.as_duration())
            .timeout(config.request_timeout.as_duration())
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_token: config.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Join path segments onto the base URL, percent-encoding each one
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let request = match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout
            } else {
                RemoteError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::Auth(status.as_u16()));
        }
        if !status.is_success() {
            let message = status.canonical_reason().unwrap_or("Unknown").to_string();
            warn!(status = status.as_u16(), url = %response.url(), "Server returned error status");
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(%url, "GET");
        let response = self.send(self.client.get(url)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn fetch_balance(&self) -> Result<i64> {
        let url = self.url(&["api", "credits", "balance"])?;
        let response: BalanceResponse = self.get_json(url).await?;
        Ok(response.balance)
    }

    async fn fetch_jobs(&self, scope: JobScope) -> Result<Vec<ServerJob>> {
        let mut url = self.url(&["api", "jobs", "active"])?;
        if scope == JobScope::All {
            url.query_pairs_mut().append_pair("include", "all");
        }
        let payload: JobsPayload = self.get_json(url).await?;
        Ok(payload.into())
    }

    async fn fetch_job(&self, server_id: &str) -> Result<Option<ServerJob>> {
        let url = self.url(&["api", "jobs", server_id])?;
        match self.get_json(url).await {
            Ok(job) => Ok(Some(job)),
            Err(RemoteError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn health(&self) -> Result<HealthStatus> {
        let url = self.url(&["api", "health"])?;
        self.get_json(url).await
    }

    async fn request_refund(&self, request: &RefundRequest) -> Result<()> {
        let url = self.url(&["api", "credits", "refund"])?;
        debug!(%url, job_id = %request.job_id, amount = request.amount, "POST refund");
        self.send(self.client.post(url).json(request)).await?;
        Ok(())
    }
}
