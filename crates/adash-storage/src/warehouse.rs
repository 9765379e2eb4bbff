use adash_core::{Secret, TableSchema, WarehouseRow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{FetchError, HttpFetcher};

/// One rejected row as reported by the sink. `index` points into the submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowInsertError {
    pub index: usize,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("{} row(s) rejected by the warehouse", .0.len())]
    RowErrors(Vec<RowInsertError>),
    #[error("warehouse request failed: {0}")]
    Request(String),
}

/// Batch insert contract of the analytics warehouse. One call per batch,
/// all-or-nothing from the caller's point of view.
#[async_trait]
pub trait WarehouseSink: Send + Sync {
    async fn insert_rows(
        &self,
        request_id: Uuid,
        table: &TableSchema,
        rows: &[WarehouseRow],
    ) -> Result<usize, SinkError>;
}

/// Streaming insert against a `tabledata.insertAll`-style REST endpoint.
#[derive(Debug, Clone)]
pub struct BigQueryInsertSink {
    http: HttpFetcher,
    endpoint: String,
    project: String,
    access_token: Option<Secret>,
}

impl BigQueryInsertSink {
    pub fn new(
        http: HttpFetcher,
        endpoint: impl Into<String>,
        project: impl Into<String>,
        access_token: Option<Secret>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            project: project.into(),
            access_token,
        }
    }

    pub fn insert_url(&self, table: &TableSchema) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}/insertAll",
            self.endpoint.trim_end_matches('/'),
            self.project,
            table.dataset,
            table.table
        )
    }
}

#[async_trait]
impl WarehouseSink for BigQueryInsertSink {
    async fn insert_rows(
        &self,
        request_id: Uuid,
        table: &TableSchema,
        rows: &[WarehouseRow],
    ) -> Result<usize, SinkError> {
        let body = json!({
            "kind": "bigquery#tableDataInsertAllRequest",
            "skipInvalidRows": false,
            "ignoreUnknownValues": false,
            "rows": rows.iter().map(|r| json!({ "json": r })).collect::<Vec<_>>(),
        });
        let token = self.access_token.as_ref().map(Secret::expose);
        let resp = self
            .http
            .post_json(request_id, &self.insert_url(table), token, &body)
            .await
            .map_err(request_failure)?;
        let value = resp
            .json()
            .map_err(|e| SinkError::Request(format!("unreadable insert response: {e}")))?;
        parse_insert_response(&value)?;
        Ok(rows.len())
    }
}

fn request_failure(err: FetchError) -> SinkError {
    let message = match &err {
        FetchError::HttpStatus { status, body, .. } => {
            let detail = serde_json::from_str::<JsonValue>(body)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("http status {status}"));
            format!("{status}: {detail}")
        }
        FetchError::Request(e) => e.to_string(),
    };
    SinkError::Request(message)
}

#[derive(Debug, Deserialize)]
struct InsertAllResponse {
    #[serde(default, rename = "insertErrors")]
    insert_errors: Vec<InsertErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct InsertErrorEntry {
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        let message = self.message.as_deref().unwrap_or("no message");
        match (&self.reason, &self.location) {
            (Some(reason), Some(location)) if !location.is_empty() => {
                format!("{reason} at {location}: {message}")
            }
            (Some(reason), _) => format!("{reason}: {message}"),
            _ => message.to_string(),
        }
    }
}

/// Interprets a successful-status insertAll body: any `insertErrors` entry turns
/// the call into a per-row failure.
pub fn parse_insert_response(value: &JsonValue) -> Result<(), SinkError> {
    let parsed: InsertAllResponse = serde_json::from_value(value.clone())
        .map_err(|e| SinkError::Request(format!("unexpected insert response shape: {e}")))?;
    if parsed.insert_errors.is_empty() {
        return Ok(());
    }
    Err(SinkError::RowErrors(
        parsed
            .insert_errors
            .into_iter()
            .map(|entry| RowInsertError {
                index: entry.index,
                messages: entry.errors.iter().map(ErrorProto::describe).collect(),
            })
            .collect(),
    ))
}

/// In-process sink that records what it was given. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    inserted: Mutex<Vec<(String, WarehouseRow)>>,
    calls: Mutex<usize>,
    reject_with: Option<SinkError>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that fails every insert with `err` and stores nothing.
    pub fn rejecting(err: SinkError) -> Self {
        Self {
            reject_with: Some(err),
            ..Self::default()
        }
    }

    pub async fn rows(&self) -> Vec<(String, WarehouseRow)> {
        self.inserted.lock().await.clone()
    }

    pub async fn calls(&self) -> usize {
        *self.calls.lock().await
    }
}

#[async_trait]
impl WarehouseSink for MemorySink {
    async fn insert_rows(
        &self,
        _request_id: Uuid,
        table: &TableSchema,
        rows: &[WarehouseRow],
    ) -> Result<usize, SinkError> {
        *self.calls.lock().await += 1;
        if let Some(err) = &self.reject_with {
            return Err(err.clone());
        }
        let mut inserted = self.inserted.lock().await;
        let name = table.qualified_name();
        inserted.extend(rows.iter().cloned().map(|r| (name.clone(), r)));
        Ok(rows.len())
    }
}
