//! HTTP plumbing, secret lookup and warehouse sinks for the ingestion pipeline.

mod secrets;
mod warehouse;

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use secrets::{DocumentSecretProvider, EnvSecretProvider, SecretError, SecretProvider};
pub use warehouse::{
    parse_insert_response, BigQueryInsertSink, MemorySink, RowInsertError, SinkError, WarehouseSink,
};

pub const CRATE_NAME: &str = "adash-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

/// Thin reqwest wrapper. Issues exactly one request per call; retrying is the
/// task queue's job.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::HttpStatus { status, .. } => Some(*status),
        }
    }

    /// Upstream response body for status errors, the transport message otherwise.
    pub fn detail(&self) -> String {
        match self {
            FetchError::Request(err) => err.to_string(),
            FetchError::HttpStatus { body, .. } => body.clone(),
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(
        &self,
        request_id: Uuid,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url).query(query);
        self.send(request_id, "GET", request).await
    }

    pub async fn post_json(
        &self,
        request_id: Uuid,
        url: &str,
        bearer_token: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        self.send(request_id, "POST", request).await
    }

    async fn send(
        &self,
        request_id: Uuid,
        method: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let request = request.build()?;
        let url = redact_url(request.url().as_str());
        let span = info_span!("http_fetch", %request_id, method, url = %url);

        async move {
            let resp = self.client.execute(request).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "upstream responded");

            if status.is_success() {
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                });
            }

            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: redact_url(&final_url),
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        }
        .instrument(span)
        .await
    }
}

/// Copy of `url` with credential-bearing query values replaced, for logs only.
pub fn redact_url(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    let pairs = parsed
        .query_pairs()
        .map(|(k, v)| {
            let k = k.into_owned();
            let v = if is_sensitive_query_key(&k) {
                "REDACTED".to_string()
            } else {
                v.into_owned()
            };
            (k, v)
        })
        .collect::<Vec<_>>();
    if !pairs.iter().any(|(k, _)| is_sensitive_query_key(k)) {
        return url.to_string();
    }
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}

fn is_sensitive_query_key(key: &str) -> bool {
    matches!(
        key.to_ascii_lowercase().as_str(),
        "key" | "api_key" | "apikey" | "access_token" | "token"
    )
}
