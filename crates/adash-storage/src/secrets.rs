use adash_core::Secret;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::HttpFetcher;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret lookup failed: {0}")]
    Lookup(String),
    #[error("secret field `{0}` not present")]
    Missing(String),
}

/// Source of the API key used for PageSpeed-style upstreams. Queried on every
/// request; implementations must not cache.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn api_key(&self) -> Result<Secret, SecretError>;
}

/// Reads one field out of a key-value document served over HTTP.
///
/// Both a flat `{"field": "value"}` object and the Firestore REST shape
/// `{"fields": {"field": {"stringValue": "value"}}}` are understood.
#[derive(Debug, Clone)]
pub struct DocumentSecretProvider {
    http: HttpFetcher,
    document_url: String,
    field: String,
}

impl DocumentSecretProvider {
    pub fn new(
        http: HttpFetcher,
        document_url: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            http,
            document_url: document_url.into(),
            field: field.into(),
        }
    }
}

#[async_trait]
impl SecretProvider for DocumentSecretProvider {
    async fn api_key(&self) -> Result<Secret, SecretError> {
        let resp = self
            .http
            .get(Uuid::new_v4(), &self.document_url, &[])
            .await
            .map_err(|e| SecretError::Lookup(e.to_string()))?;
        let doc = resp
            .json()
            .map_err(|e| SecretError::Lookup(format!("credentials document is not JSON: {e}")))?;
        extract_secret_field(&doc, &self.field)
    }
}

pub(crate) fn extract_secret_field(doc: &JsonValue, field: &str) -> Result<Secret, SecretError> {
    let value = doc
        .get("fields")
        .and_then(|f| f.get(field))
        .and_then(|f| f.get("stringValue"))
        .or_else(|| doc.get(field))
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    value
        .map(Secret::new)
        .ok_or_else(|| SecretError::Missing(field.to_string()))
}

/// Reads the key from an environment variable at call time.
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    var: String,
}

impl EnvSecretProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn api_key(&self) -> Result<Secret, SecretError> {
        match std::env::var(&self.var) {
            Ok(v) if !v.trim().is_empty() => Ok(Secret::new(v.trim())),
            _ => Err(SecretError::Missing(self.var.clone())),
        }
    }
}
