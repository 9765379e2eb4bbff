//! Turns fetched reports into warehouse rows.

use adash_core::{CellValue, IngestionBatch, RawRecord, RawReport, Target, WarehouseRow};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::columns::{
    resource_size_column, ADS_REPORT_COLUMNS, AUDIT_COLUMNS, BASE_URL_COLUMN, CID_COLUMN,
    CLIENT_NAME_COLUMN, LANDING_PAGE_COLUMN, RESOURCE_CATEGORIES,
};
use crate::normalize::{normalize_record, normalize_value};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("audit result is missing required metric `{0}`")]
    MissingMetric(String),
    #[error("{family} report cannot be built for a `{target}` target")]
    FamilyMismatch {
        family: &'static str,
        target: &'static str,
    },
}

/// Where one warehouse column is read from inside an audit result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub path: Vec<&'static str>,
    pub column: &'static str,
    pub required: bool,
}

impl MetricDescriptor {
    fn new(path: Vec<&'static str>, column: &'static str, required: bool) -> Self {
        Self {
            path,
            column,
            required,
        }
    }

    fn read<'a>(&self, doc: &'a JsonValue) -> Option<&'a JsonValue> {
        let mut cur = doc;
        for segment in &self.path {
            cur = cur.get(*segment)?;
        }
        (!cur.is_null()).then_some(cur)
    }
}

/// Every metric the audit row expects, in column order.
pub fn audit_descriptors() -> Vec<MetricDescriptor> {
    let mut out = vec![
        MetricDescriptor::new(vec!["fetchTime"], "date", true),
        MetricDescriptor::new(vec!["finalUrl"], "final_url", false),
        MetricDescriptor::new(vec!["categories", "performance", "score"], "lhscore", false),
    ];
    out.extend(AUDIT_COLUMNS.upstream_names().filter_map(|audit_id| {
        AUDIT_COLUMNS.warehouse_for(audit_id).map(|column| {
            MetricDescriptor::new(vec!["audits", audit_id, "numericValue"], column, false)
        })
    }));
    out
}

/// Builds the batch for whichever report family was fetched.
pub fn build_batch(report: &RawReport, target: &Target) -> Result<IngestionBatch, BuildError> {
    match (report, target) {
        (RawReport::Tabular(records), Target::Client { cid, name }) => {
            Ok(build_ads_batch(records, cid, name.as_deref()))
        }
        (RawReport::Audit(doc), Target::Url(url)) => Ok(vec![build_audit_row(doc, url)?]),
        (report, target) => Err(BuildError::FamilyMismatch {
            family: report.family(),
            target: target.id_field(),
        }),
    }
}

/// One row per report record, tagged with the client it was requested for.
pub fn build_ads_batch(
    records: &[RawRecord],
    cid: &str,
    client_name: Option<&str>,
) -> IngestionBatch {
    records
        .iter()
        .map(|record| {
            let mut row = normalize_record(ADS_REPORT_COLUMNS.map_record(record));
            if let Some(landing_page) = row.get(LANDING_PAGE_COLUMN).cloned() {
                row.insert(BASE_URL_COLUMN.to_string(), landing_page);
            }
            row.insert(CID_COLUMN.to_string(), CellValue::Text(cid.to_string()));
            if let Some(name) = client_name {
                row.insert(CLIENT_NAME_COLUMN.to_string(), CellValue::Text(name.to_string()));
            }
            row
        })
        .collect()
}

/// Single `lh_data` row for the audit of `url`.
pub fn build_audit_row(doc: &JsonValue, url: &str) -> Result<WarehouseRow, BuildError> {
    let doc = doc.get("lighthouseResult").unwrap_or(doc);
    let mut row = WarehouseRow::new();

    for descriptor in audit_descriptors() {
        let value = descriptor.read(doc).and_then(CellValue::from_json);
        match value {
            Some(value) => {
                if let Some(value) = normalize_value(value) {
                    row.insert(descriptor.column.to_string(), value);
                }
            }
            None if descriptor.required => {
                return Err(BuildError::MissingMetric(descriptor.path.join(".")));
            }
            None => debug!(column = descriptor.column, "audit metric absent, skipping"),
        }
    }

    for (column, size) in resource_sizes(doc) {
        row.insert(column, size);
    }
    row.insert("url".to_string(), CellValue::Text(url.to_string()));
    Ok(row)
}

/// `<category>_size` columns from the resource summary, using `transferSize`.
fn resource_sizes(doc: &JsonValue) -> Vec<(String, CellValue)> {
    let Some(items) = doc
        .pointer("/audits/resource-summary/details/items")
        .and_then(JsonValue::as_array)
    else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for item in items {
        let Some(resource_type) = item.get("resourceType").and_then(JsonValue::as_str) else {
            continue;
        };
        let category = normalize_category(resource_type);
        if category == "total" {
            continue;
        }
        if !RESOURCE_CATEGORIES.contains(&category.as_str()) {
            warn!(resource_type, "unknown resource category, not recorded");
            continue;
        }
        if let Some(size) = item.get("transferSize").and_then(CellValue::from_json) {
            out.push((resource_size_column(&category), size));
        }
    }
    out
}

fn normalize_category(resource_type: &str) -> String {
    resource_type
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}
