//! Core report and warehouse data model for the agency dashboard ingestion.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "adash-core";

/// A single scalar as it travels from an upstream report into a warehouse row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    /// Converts a JSON scalar; objects, arrays and nulls have no cell form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(CellValue::Text(s.clone())),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(CellValue::Int)
                .or_else(|| n.as_f64().map(CellValue::Float)),
            serde_json::Value::Bool(b) => Some(CellValue::Int(i64::from(*b))),
            _ => None,
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

/// One upstream record keyed by upstream (or, after mapping, warehouse) field name.
pub type RawRecord = BTreeMap<String, CellValue>;

/// Warehouse column name -> typed value, built fresh for every upstream record.
pub type WarehouseRow = BTreeMap<String, CellValue>;

/// Rows submitted together in one insert call. Order matches upstream order so
/// per-row error indexes can be traced back.
pub type IngestionBatch = Vec<WarehouseRow>;

/// Report content as fetched from upstream. Never mutated after the fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum RawReport {
    /// CSV text with a header row, one record per data line.
    Tabular(Vec<RawRecord>),
    /// A single nested audit result document.
    Audit(serde_json::Value),
}

impl RawReport {
    pub fn family(&self) -> &'static str {
        match self {
            RawReport::Tabular(_) => "tabular",
            RawReport::Audit(_) => "audit",
        }
    }
}

/// Warehouse table reference plus the columns it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub dataset: String,
    pub table: String,
    columns: BTreeSet<String>,
}

impl TableSchema {
    pub fn new<I, S>(dataset: impl Into<String>, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dataset: dataset.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn declares(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    /// First key of `row` the table does not declare, if any.
    pub fn undeclared_column<'a>(&self, row: &'a WarehouseRow) -> Option<&'a str> {
        row.keys().map(String::as_str).find(|k| !self.declares(k))
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.dataset, self.table)
    }
}

/// What a request asks to ingest. The identifying value is stamped on every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Client { cid: String, name: Option<String> },
    Url(String),
}

impl Target {
    /// Name of the identifying field echoed back to the caller.
    pub fn id_field(&self) -> &'static str {
        match self {
            Target::Client { .. } => "cid",
            Target::Url(_) => "url",
        }
    }

    pub fn id_value(&self) -> &str {
        match self {
            Target::Client { cid, .. } => cid,
            Target::Url(url) => url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("Invalid date in startdate parameter.")]
    InvalidDate(String),
    #[error("startdate in the future (start_date: {0})")]
    InFuture(NaiveDate),
}

/// Date range requested from the ads report upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportWindow {
    Yesterday,
    Today,
    Range { start: NaiveDate, end: NaiveDate },
}

impl ReportWindow {
    /// Derives the window from an optional ISO `startdate`; the range always ends today.
    pub fn from_start_date(start: Option<&str>, today: NaiveDate) -> Result<Self, WindowError> {
        let Some(raw) = start.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(ReportWindow::Yesterday);
        };
        let start = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| WindowError::InvalidDate(raw.to_string()))?;
        if start == today {
            Ok(ReportWindow::Today)
        } else if start > today {
            Err(WindowError::InFuture(start))
        } else {
            Ok(ReportWindow::Range { start, end: today })
        }
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        match self {
            ReportWindow::Yesterday => vec![("during", "YESTERDAY".to_string())],
            ReportWindow::Today => vec![("during", "TODAY".to_string())],
            ReportWindow::Range { start, end } => vec![
                ("start", start.format("%Y%m%d").to_string()),
                ("end", end.format("%Y%m%d").to_string()),
            ],
        }
    }
}

/// An API key handed out by the secret provider. Debug output never shows it.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(REDACTED)")
    }
}
