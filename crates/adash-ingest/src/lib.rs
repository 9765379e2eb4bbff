//! Request-scoped ingestion: fetch a report, build rows, insert them.

mod client;

use std::sync::Arc;
use std::time::Duration;

use adash_adapters::{
    ads_table, audit_table, build_batch, AdapterContext, AdsReportSource, AuditMode, AuditSource,
    FetchFailureKind, ReportSource, SourceError,
};
use adash_core::{ReportWindow, Secret, TableSchema, Target};
use adash_storage::{
    redact_url, BigQueryInsertSink, DocumentSecretProvider, EnvSecretProvider, HttpClientConfig,
    HttpFetcher, MemorySink, SecretProvider, WarehouseSink,
};
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use client::{IngestError, IngestionClient};

pub const CRATE_NAME: &str = "adash-ingest";

pub const MISSING_PARAMETER: &str = "Missing query parameter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditBackend {
    Runner,
    PageSpeed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub ads_report_endpoint: String,
    pub audit_backend: AuditBackend,
    pub audit_runner_endpoint: String,
    pub pagespeed_endpoint: String,
    pub pagespeed_strategy: String,
    pub secret_document_url: Option<String>,
    pub secret_field: String,
    pub pagespeed_key_var: String,
    pub warehouse_endpoint: String,
    pub warehouse_project: Option<String>,
    pub warehouse_dataset: String,
    pub warehouse_access_token: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub port: u16,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset and blank values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let audit_mode = get("AUDIT_MODE").map(|mode| mode.to_ascii_lowercase());
        let audit_backend = match audit_mode.as_deref() {
            None | Some("runner") => AuditBackend::Runner,
            Some("pagespeed") => AuditBackend::PageSpeed,
            Some(other) => bail!("AUDIT_MODE must be `runner` or `pagespeed`, got `{other}`"),
        };
        let http_timeout_secs = match get("ADASH_HTTP_TIMEOUT_SECS") {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("parsing ADASH_HTTP_TIMEOUT_SECS={v}"))?,
            None => 60,
        };
        let port = match get("PORT") {
            Some(v) => v.parse::<u16>().with_context(|| format!("parsing PORT={v}"))?,
            None => 8081,
        };

        Ok(Self {
            ads_report_endpoint: or("ADS_REPORT_ENDPOINT", "http://127.0.0.1:8090/report"),
            audit_backend,
            audit_runner_endpoint: or("AUDIT_RUNNER_ENDPOINT", "http://127.0.0.1:8082/"),
            pagespeed_endpoint: or(
                "PAGESPEED_ENDPOINT",
                "https://www.googleapis.com/pagespeedonline/v5/runPagespeed",
            ),
            pagespeed_strategy: or("PAGESPEED_STRATEGY", "mobile"),
            secret_document_url: get("SECRET_DOCUMENT_URL"),
            secret_field: or("SECRET_FIELD", "psi_api_token"),
            pagespeed_key_var: "PAGESPEED_API_KEY".to_string(),
            warehouse_endpoint: or(
                "WAREHOUSE_ENDPOINT",
                "https://bigquery.googleapis.com/bigquery/v2",
            ),
            warehouse_project: get("GOOGLE_CLOUD_PROJECT"),
            warehouse_dataset: or("WAREHOUSE_DATASET", "agency_dashboard"),
            warehouse_access_token: get("WAREHOUSE_ACCESS_TOKEN"),
            http_timeout_secs,
            user_agent: or("ADASH_USER_AGENT", "adash-ingest/0.1"),
            port,
        })
    }

    fn secret_provider(&self, http: HttpFetcher) -> Arc<dyn SecretProvider> {
        match &self.secret_document_url {
            Some(url) => Arc::new(DocumentSecretProvider::new(
                http,
                url.clone(),
                self.secret_field.clone(),
            )),
            None => Arc::new(EnvSecretProvider::new(self.pagespeed_key_var.clone())),
        }
    }
}

/// Every way a request can fail, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{message}")]
    UpstreamNotFound { cause: &'static str, message: String },
    #[error("{message}")]
    UpstreamQuotaExceeded { cause: &'static str, message: String },
    #[error("{message}")]
    UpstreamTransientFailure { cause: &'static str, message: String },
    #[error("{message}")]
    ReportMalformed { cause: &'static str, message: String },
    #[error("Unable to load API credentials.")]
    SecretUnavailable(String),
    #[error("{rejected} of {submitted} rows rejected by the warehouse")]
    WarehousePartialFailure { rejected: usize, submitted: usize },
    #[error("Unable to insert rows into the warehouse.")]
    WarehouseHardFailure(String),
}

impl PipelineError {
    /// Whether redelivering the same request can succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            PipelineError::InvalidRequest(_) | PipelineError::UpstreamNotFound { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidRequest(_) => "INVALID_REQUEST",
            PipelineError::UpstreamNotFound { .. } => "UPSTREAM_NOT_FOUND",
            PipelineError::UpstreamQuotaExceeded { .. } => "UPSTREAM_QUOTA_EXCEEDED",
            PipelineError::UpstreamTransientFailure { .. }
            | PipelineError::ReportMalformed { .. } => "UPSTREAM_FAILURE",
            PipelineError::SecretUnavailable(_) => "SECRET_UNAVAILABLE",
            PipelineError::WarehousePartialFailure { .. } => "WAREHOUSE_PARTIAL_FAILURE",
            PipelineError::WarehouseHardFailure(_) => "WAREHOUSE_FAILURE",
        }
    }

    /// Which collaborator failed, if any.
    pub fn cause(&self) -> Option<&'static str> {
        match self {
            PipelineError::InvalidRequest(_) => None,
            PipelineError::UpstreamNotFound { cause, .. }
            | PipelineError::UpstreamQuotaExceeded { cause, .. }
            | PipelineError::UpstreamTransientFailure { cause, .. }
            | PipelineError::ReportMalformed { cause, .. } => Some(*cause),
            PipelineError::SecretUnavailable(_) => Some("SECRETS"),
            PipelineError::WarehousePartialFailure { .. }
            | PipelineError::WarehouseHardFailure(_) => Some("BQ"),
        }
    }

    fn from_source(cause: &'static str, err: SourceError) -> Self {
        match err {
            SourceError::Upstream(failure) => {
                let message = failure.message;
                match failure.kind {
                    FetchFailureKind::NotFound => {
                        PipelineError::UpstreamNotFound { cause, message }
                    }
                    FetchFailureKind::QuotaExceeded => {
                        PipelineError::UpstreamQuotaExceeded { cause, message }
                    }
                    FetchFailureKind::Transient => {
                        PipelineError::UpstreamTransientFailure { cause, message }
                    }
                }
            }
            SourceError::Secret(e) => PipelineError::SecretUnavailable(e.to_string()),
            SourceError::Malformed(message) => PipelineError::ReportMalformed { cause, message },
            err @ SourceError::UnsupportedTarget { .. } => {
                PipelineError::InvalidRequest(err.to_string())
            }
        }
    }
}

impl From<IngestError> for PipelineError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Partial { rejected, submitted } => {
                PipelineError::WarehousePartialFailure { rejected, submitted }
            }
            other => PipelineError::WarehouseHardFailure(other.to_string()),
        }
    }
}

/// A validated ingestion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub target: Target,
    pub window: ReportWindow,
}

impl IngestRequest {
    pub fn ads(
        cid: Option<&str>,
        name: Option<&str>,
        start_date: Option<&str>,
        today: NaiveDate,
    ) -> Result<Self, PipelineError> {
        let cid = non_blank(cid)
            .ok_or_else(|| PipelineError::InvalidRequest(MISSING_PARAMETER.into()))?;
        let window = ReportWindow::from_start_date(start_date, today)
            .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            target: Target::Client {
                cid: cid.to_string(),
                name: non_blank(name).map(str::to_string),
            },
            window,
        })
    }

    pub fn audit(url: Option<&str>) -> Result<Self, PipelineError> {
        let url = non_blank(url)
            .ok_or_else(|| PipelineError::InvalidRequest(MISSING_PARAMETER.into()))?;
        if !is_http_url(url) {
            return Err(PipelineError::InvalidRequest(format!(
                "url must be an absolute http(s) URL: {url}"
            )));
        }
        Ok(Self {
            target: Target::Url(url.to_string()),
            window: ReportWindow::Yesterday,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn is_http_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    ["http://", "https://"].iter().any(|scheme| {
        lower
            .strip_prefix(scheme)
            .is_some_and(|rest| rest.chars().next().is_some_and(|c| c != '/' && !c.is_whitespace()))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub request_id: Uuid,
    pub id_field: &'static str,
    pub id_value: String,
    pub rows_inserted: usize,
}

/// Wires report sources, the row builder and the ingestion client together.
/// Built once at startup; shared between requests.
#[derive(Clone)]
pub struct IngestPipeline {
    ads: Arc<dyn ReportSource>,
    audit: Arc<dyn ReportSource>,
    client: IngestionClient,
    dataset: String,
}

impl IngestPipeline {
    pub fn new(
        ads: Arc<dyn ReportSource>,
        audit: Arc<dyn ReportSource>,
        sink: Arc<dyn WarehouseSink>,
        dataset: impl Into<String>,
    ) -> Self {
        Self {
            ads,
            audit,
            client: IngestionClient::new(sink),
            dataset: dataset.into(),
        }
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;

        let ads = Arc::new(AdsReportSource::new(http.clone(), config.ads_report_endpoint.clone()));
        let mode = match config.audit_backend {
            AuditBackend::Runner => AuditMode::Runner {
                endpoint: config.audit_runner_endpoint.clone(),
            },
            AuditBackend::PageSpeed => AuditMode::PageSpeed {
                endpoint: config.pagespeed_endpoint.clone(),
                strategy: config.pagespeed_strategy.clone(),
                secrets: config.secret_provider(http.clone()),
            },
        };
        let audit = Arc::new(AuditSource::new(http.clone(), mode));

        let sink: Arc<dyn WarehouseSink> = match &config.warehouse_project {
            Some(project) => Arc::new(BigQueryInsertSink::new(
                http,
                config.warehouse_endpoint.clone(),
                project.clone(),
                config.warehouse_access_token.clone().map(Secret::new),
            )),
            None => {
                warn!("GOOGLE_CLOUD_PROJECT is not set; rows are kept in memory only");
                Arc::new(MemorySink::new())
            }
        };

        Ok(Self::new(ads, audit, sink, config.warehouse_dataset.clone()))
    }

    fn route(&self, target: &Target) -> (&dyn ReportSource, TableSchema) {
        match target {
            Target::Client { .. } => (self.ads.as_ref(), ads_table(&self.dataset)),
            Target::Url(_) => (self.audit.as_ref(), audit_table(&self.dataset)),
        }
    }

    pub async fn run(&self, request: &IngestRequest) -> Result<IngestOutcome, PipelineError> {
        let ctx = AdapterContext::new();
        let span = info_span!(
            "ingest_request",
            request_id = %ctx.request_id,
            target = request.target.id_field(),
            id = %redact_url(request.target.id_value()),
        );

        async move {
            info!(state = "START", window = ?request.window, "request accepted");
            let result = self.run_stages(&ctx, request).await;
            match &result {
                Ok(outcome) => {
                    info!(state = "DONE", rows = outcome.rows_inserted, "request finished")
                }
                Err(err) => warn!(
                    state = "FAILED",
                    code = err.code(),
                    retriable = err.is_retriable(),
                    error = %err,
                    "request failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        ctx: &AdapterContext,
        request: &IngestRequest,
    ) -> Result<IngestOutcome, PipelineError> {
        let (source, table) = self.route(&request.target);

        info!(state = "FETCHING", cause = source.cause());
        let report = source
            .fetch(ctx, &request.target, &request.window)
            .await
            .map_err(|e| PipelineError::from_source(source.cause(), e))?;

        info!(state = "BUILDING", family = report.family());
        let batch =
            build_batch(&report, &request.target).map_err(|e| PipelineError::ReportMalformed {
                cause: source.cause(),
                message: e.to_string(),
            })?;

        info!(state = "INSERTING", rows = batch.len(), table = %table.qualified_name());
        let rows_inserted = self.client.ingest(ctx.request_id, &table, batch).await?;

        Ok(IngestOutcome {
            request_id: ctx.request_id,
            id_field: request.target.id_field(),
            id_value: request.target.id_value().to_string(),
            rows_inserted,
        })
    }
}
