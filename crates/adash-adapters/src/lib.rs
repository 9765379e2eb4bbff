//! Report source contracts, upstream failure classification, schema mapping,
//! value normalization and row building.

pub mod columns;
pub mod normalize;
pub mod rows;

use std::fmt;
use std::sync::Arc;

use adash_core::{CellValue, RawRecord, RawReport, ReportWindow, Target};
use adash_storage::{FetchError, HttpFetcher, SecretError, SecretProvider};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub use columns::{ads_table, audit_table, ColumnMap, ADS_REPORT_COLUMNS, AUDIT_COLUMNS};
pub use normalize::normalize_value;
pub use rows::{
    audit_descriptors, build_ads_batch, build_audit_row, build_batch, BuildError, MetricDescriptor,
};

pub const CRATE_NAME: &str = "adash-adapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub request_id: Uuid,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailureKind {
    /// The target has no data upstream. Retrying will not help.
    NotFound,
    QuotaExceeded,
    Transient,
}

/// Typed upstream failure, classified once at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub kind: FetchFailureKind,
    pub message: String,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream failure ({0})")]
    Upstream(FetchFailure),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("malformed report: {0}")]
    Malformed(String),
    #[error("{source_name} cannot fetch a `{target}` target")]
    UnsupportedTarget {
        source_name: &'static str,
        target: &'static str,
    },
}

#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Short tag naming the upstream in caller-visible error payloads.
    fn cause(&self) -> &'static str;

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        target: &Target,
        window: &ReportWindow,
    ) -> Result<RawReport, SourceError>;
}

/// The one place where upstream failures are classified from a status code
/// and free-text message. A status code embedded in the message (for example
/// `"... (Status code: 404)"`) wins over the transport status.
pub fn classify_upstream_error(status: Option<u16>, message: &str) -> FetchFailureKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("quota")
        || lower.contains("resource_exhausted")
        || lower.contains("ratelimitexceeded")
    {
        return FetchFailureKind::QuotaExceeded;
    }
    if lower.contains("dns_failure") {
        return FetchFailureKind::NotFound;
    }
    match embedded_status_code(&lower).or(status) {
        Some(404 | 410) => FetchFailureKind::NotFound,
        Some(429) => FetchFailureKind::QuotaExceeded,
        _ => FetchFailureKind::Transient,
    }
}

fn embedded_status_code(lower_message: &str) -> Option<u16> {
    let idx = lower_message.find("status code")?;
    let rest = &lower_message[idx + "status code".len()..];
    let digits = rest
        .trim_start_matches(|c: char| c == ':' || c == ' ' || c == '=')
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    if digits.len() == 3 {
        digits.parse().ok()
    } else {
        None
    }
}

/// Extracts `(code, message)` from `{"error": {"code", "message"}}` or
/// `{"error": true, "message"}` bodies.
pub fn upstream_error_payload(body: &JsonValue) -> Option<(Option<u16>, String)> {
    let error = body.get("error")?;
    match error {
        JsonValue::Object(obj) => {
            let code = obj
                .get("code")
                .and_then(JsonValue::as_u64)
                .and_then(|c| u16::try_from(c).ok());
            let message = obj
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("upstream error")
                .to_string();
            Some((code, message))
        }
        JsonValue::Bool(true) => Some((
            None,
            body.get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("upstream error")
                .to_string(),
        )),
        JsonValue::String(s) => Some((None, s.clone())),
        _ => None,
    }
}

fn failure_from_payload(status: Option<u16>, payload: (Option<u16>, String)) -> FetchFailure {
    let (code, message) = payload;
    FetchFailure {
        kind: classify_upstream_error(code.or(status), &message),
        message,
    }
}

fn failure_from_fetch_error(err: &FetchError) -> FetchFailure {
    let status = err.status();
    let detail = err.detail();
    match serde_json::from_str::<JsonValue>(&detail)
        .ok()
        .and_then(|v| upstream_error_payload(&v))
    {
        Some(payload) => failure_from_payload(status, payload),
        None => FetchFailure {
            kind: classify_upstream_error(status, &detail),
            message: if detail.trim().is_empty() {
                err.to_string()
            } else {
                detail
            },
        },
    }
}

/// Landing page report endpoint returning CSV with a header row.
#[derive(Debug, Clone)]
pub struct AdsReportSource {
    http: HttpFetcher,
    endpoint: String,
}

impl AdsReportSource {
    pub fn new(http: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ReportSource for AdsReportSource {
    fn cause(&self) -> &'static str {
        "ADS"
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        target: &Target,
        window: &ReportWindow,
    ) -> Result<RawReport, SourceError> {
        let Target::Client { cid, .. } = target else {
            return Err(SourceError::UnsupportedTarget {
                source_name: "ads report",
                target: target.id_field(),
            });
        };
        let mut query = vec![("cid", cid.clone())];
        query.extend(window.query_pairs());

        let resp = self
            .http
            .get(ctx.request_id, &self.endpoint, &query)
            .await
            .map_err(|e| SourceError::Upstream(failure_from_fetch_error(&e)))?;
        let records = parse_csv_report(&resp.text())?;
        info!(request_id = %ctx.request_id, cid = %cid, rows = records.len(), "ads report fetched");
        Ok(RawReport::Tabular(records))
    }
}

/// Parses CSV text with a header row into records keyed by header name.
pub fn parse_csv_report(text: &str) -> Result<Vec<RawRecord>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| SourceError::Malformed(format!("reading CSV header: {e}")))?
        .clone();

    let mut out = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| SourceError::Malformed(format!("CSV record {line}: {e}")))?;
        out.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.to_string(), CellValue::Text(v.to_string())))
                .collect(),
        );
    }
    Ok(out)
}

#[derive(Clone)]
pub enum AuditMode {
    /// An audit runner that answers with the Lighthouse result itself.
    Runner { endpoint: String },
    /// PageSpeed Insights style API; needs a fresh API key per call.
    PageSpeed {
        endpoint: String,
        strategy: String,
        secrets: Arc<dyn SecretProvider>,
    },
}

impl fmt::Debug for AuditMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditMode::Runner { endpoint } => {
                f.debug_struct("Runner").field("endpoint", endpoint).finish()
            }
            AuditMode::PageSpeed { endpoint, strategy, .. } => f
                .debug_struct("PageSpeed")
                .field("endpoint", endpoint)
                .field("strategy", strategy)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditSource {
    http: HttpFetcher,
    mode: AuditMode,
}

impl AuditSource {
    pub fn new(http: HttpFetcher, mode: AuditMode) -> Self {
        Self { http, mode }
    }
}

#[async_trait]
impl ReportSource for AuditSource {
    fn cause(&self) -> &'static str {
        "LH"
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        target: &Target,
        _window: &ReportWindow,
    ) -> Result<RawReport, SourceError> {
        let Target::Url(url) = target else {
            return Err(SourceError::UnsupportedTarget {
                source_name: "audit",
                target: target.id_field(),
            });
        };

        let result = match &self.mode {
            AuditMode::Runner { endpoint } => {
                self.http
                    .get(ctx.request_id, endpoint, &[("url", url.clone())])
                    .await
            }
            AuditMode::PageSpeed {
                endpoint,
                strategy,
                secrets,
            } => {
                let key = secrets.api_key().await?;
                let query = [
                    ("url", url.clone()),
                    ("key", key.expose().to_string()),
                    ("category", "performance".to_string()),
                    ("strategy", strategy.clone()),
                ];
                self.http.get(ctx.request_id, endpoint, &query).await
            }
        };
        let resp = result.map_err(|e| SourceError::Upstream(failure_from_fetch_error(&e)))?;

        let doc = resp
            .json()
            .map_err(|e| SourceError::Malformed(format!("audit result is not JSON: {e}")))?;
        if let Some(payload) = upstream_error_payload(&doc) {
            return Err(SourceError::Upstream(failure_from_payload(
                Some(resp.status.as_u16()),
                payload,
            )));
        }
        info!(request_id = %ctx.request_id, url = %url, "audit completed");
        Ok(RawReport::Audit(doc))
    }
}
