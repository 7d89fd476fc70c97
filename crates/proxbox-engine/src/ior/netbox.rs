//! NetBox REST client

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use super::IorSession;
use crate::error::IorError;
use crate::model::{Record, RecordKind, SearchFilter};

/// Connection settings for NetBox
#[derive(Debug, Clone)]
pub struct NetboxSettings {
    /// Base URL including any base path, e.g. `https://netbox.example.com/netbox`
    pub base_url: String,
    /// API token
    pub token: String,
    /// Verify the server certificate
    pub verify_tls: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Page {
    count: usize,
    results: Vec<Record>,
}

/// NetBox session backed by `reqwest`
pub struct NetboxClient {
    settings: NetboxSettings,
    http: reqwest::Client,
}

impl NetboxClient {
    /// Build a client; no request is made until the first call
    pub fn new(settings: NetboxSettings) -> Result<Self, IorError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!settings.verify_tls)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| IorError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { settings, http })
    }

    /// Base URL the client talks to
    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    fn endpoint_url(&self, kind: RecordKind) -> String {
        format!(
            "{}/api/{}/",
            self.settings.base_url.trim_end_matches('/'),
            kind.path()
        )
    }

    fn token_header(&self) -> String {
        format!("Token {}", self.settings.token)
    }

    async fn check(endpoint: String, response: reqwest::Response) -> Result<reqwest::Response, IorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(IorError::Status {
            endpoint,
            status: status.as_u16(),
            message,
        })
    }
}

fn transport(e: reqwest::Error) -> IorError {
    IorError::Transport(e.to_string())
}

#[async_trait]
impl IorSession for NetboxClient {
    async fn find(&self, kind: RecordKind, filter: &SearchFilter) -> Result<Option<Record>, IorError> {
        let url = self.endpoint_url(kind);
        debug!("GET {}?{}", url, filter);

        let response = self
            .http
            .get(&url)
            .header(AUTHORIZATION, self.token_header())
            .header(ACCEPT, "application/json")
            .query(&filter.query_pairs())
            .send()
            .await
            .map_err(transport)?;
        let response = Self::check(kind.path(), response).await?;

        let mut page: Page = response
            .json()
            .await
            .map_err(|e| IorError::Decode(e.to_string()))?;

        let count = page.count.max(page.results.len());
        match count {
            0 => Ok(None),
            1 => Ok(page.results.pop()),
            count => Err(IorError::Ambiguous {
                endpoint: kind.path(),
                filter: filter.to_string(),
                count,
            }),
        }
    }

    async fn create(&self, kind: RecordKind, fields: &Map<String, Value>) -> Result<Record, IorError> {
        let url = self.endpoint_url(kind);
        debug!("POST {}", url);

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, self.token_header())
            .header(ACCEPT, "application/json")
            .json(fields)
            .send()
            .await
            .map_err(transport)?;
        let response = Self::check(kind.path(), response).await?;

        response
            .json()
            .await
            .map_err(|e| IorError::Decode(e.to_string()))
    }

    async fn status(&self) -> Result<Value, IorError> {
        let url = format!("{}/api/status/", self.settings.base_url.trim_end_matches('/'));
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .header(AUTHORIZATION, self.token_header())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport)?;
        let response = Self::check("status".to_string(), response).await?;

        response
            .json()
            .await
            .map_err(|e| IorError::Decode(e.to_string()))
    }
}
