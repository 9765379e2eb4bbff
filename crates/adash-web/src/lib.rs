//! Axum handlers that turn task-queue GETs into ingestion runs.

use std::sync::Arc;

use adash_ingest::{IngestConfig, IngestOutcome, IngestPipeline, IngestRequest, PipelineError};
use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "adash-web";

pub const FALLBACK_TEXT: &str = "This is not the app you were looking for.";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: IngestPipeline,
}

impl AppState {
    pub fn new(pipeline: IngestPipeline) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AdsQuery {
    cid: Option<String>,
    name: Option<String>,
    startdate: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LighthouseQuery {
    url: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ads", get(ads_handler))
        .route("/lighthouse", get(lighthouse_handler))
        .fallback(fallback_handler)
        .with_state(Arc::new(state))
}

pub async fn serve(config: &IngestConfig) -> anyhow::Result<()> {
    let pipeline = IngestPipeline::from_config(config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env()?;
    serve(&config).await
}

async fn ads_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdsQuery>,
) -> Response {
    let today = Utc::now().date_naive();
    let request = IngestRequest::ads(
        query.cid.as_deref(),
        query.name.as_deref(),
        query.startdate.as_deref(),
        today,
    );
    run(&state, request).await
}

async fn lighthouse_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LighthouseQuery>,
) -> Response {
    run(&state, IngestRequest::audit(query.url.as_deref())).await
}

async fn fallback_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, FALLBACK_TEXT)
}

async fn run(state: &AppState, request: Result<IngestRequest, PipelineError>) -> Response {
    let result = match request {
        Ok(request) => state.pipeline.run(&request).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(outcome) => created(&outcome),
        Err(err) => error_response(&err),
    }
}

fn created(outcome: &IngestOutcome) -> Response {
    let mut body = Map::new();
    body.insert(
        outcome.id_field.to_string(),
        JsonValue::String(outcome.id_value.clone()),
    );
    (StatusCode::CREATED, Json(JsonValue::Object(body))).into_response()
}

/// Status codes steer the task queue: 2xx stops redelivery, 5xx retries.
pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PipelineError::UpstreamNotFound { .. } => StatusCode::OK,
        PipelineError::UpstreamQuotaExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &PipelineError) -> Response {
    let body = match err.cause() {
        Some(cause) => json!({
            "error": err.to_string(),
            "cause": cause,
            "code": err.code(),
        }),
        None => json!({ "error": err.to_string() }),
    };
    (status_for(err), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use adash_adapters::{AdapterContext, FetchFailure, FetchFailureKind, ReportSource, SourceError};
    use adash_core::{RawRecord, RawReport, ReportWindow, Target};
    use adash_storage::{MemorySink, RowInsertError, SecretError, SinkError};
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    type Responder = Box<dyn Fn() -> Result<RawReport, SourceError> + Send + Sync>;

    struct FakeSource {
        cause: &'static str,
        respond: Responder,
    }

    #[async_trait]
    impl ReportSource for FakeSource {
        fn cause(&self) -> &'static str {
            self.cause
        }

        async fn fetch(
            &self,
            _ctx: &AdapterContext,
            _target: &Target,
            _window: &ReportWindow,
        ) -> Result<RawReport, SourceError> {
            (self.respond)()
        }
    }

    fn source(
        cause: &'static str,
        respond: impl Fn() -> Result<RawReport, SourceError> + Send + Sync + 'static,
    ) -> Arc<FakeSource> {
        Arc::new(FakeSource {
            cause,
            respond: Box::new(respond),
        })
    }

    fn ads_report() -> Result<RawReport, SourceError> {
        let mut record = RawRecord::new();
        record.insert("Campaign ID".into(), "9".into());
        record.insert("Clicks".into(), "3".into());
        Ok(RawReport::Tabular(vec![record]))
    }

    fn audit_report() -> Result<RawReport, SourceError> {
        Ok(RawReport::Audit(serde_json::json!({
            "fetchTime": "2020-06-10T08:30:00.000Z",
            "finalUrl": "https://a.com/"
        })))
    }

    fn upstream(kind: FetchFailureKind) -> SourceError {
        SourceError::Upstream(FetchFailure {
            kind,
            message: "Lighthouse returned error (Status code: 404)".into(),
        })
    }

    fn test_app(ads: Arc<FakeSource>, audit: Arc<FakeSource>, sink: Arc<MemorySink>) -> Router {
        app(AppState::new(IngestPipeline::new(ads, audit, sink, "agency_dashboard")))
    }

    fn happy_app(sink: Arc<MemorySink>) -> Router {
        test_app(source("ADS", ads_report), source("LH", audit_report), sink)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn ads_success_is_created_and_echoes_cid() {
        let sink = Arc::new(MemorySink::new());
        let (status, body) =
            get_json(happy_app(sink.clone()), "/ads?cid=123-456-7890&name=Acme").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, json!({"cid": "123-456-7890"}));
        assert_eq!(sink.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn lighthouse_success_echoes_url() {
        let sink = Arc::new(MemorySink::new());
        let (status, body) = get_json(happy_app(sink), "/lighthouse?url=https%3A%2F%2Fa.com").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, json!({"url": "https://a.com"}));
    }

    #[tokio::test]
    async fn missing_parameters_are_bad_requests() {
        for uri in ["/ads", "/ads?name=Acme", "/lighthouse", "/lighthouse?url="] {
            let (status, body) = get_json(happy_app(Arc::new(MemorySink::new())), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body, json!({"error": "Missing query parameter"}));
        }
    }

    #[tokio::test]
    async fn invalid_startdate_and_url_are_bad_requests() {
        let app = || happy_app(Arc::new(MemorySink::new()));
        let (status, body) = get_json(app(), "/ads?cid=1&startdate=2999-01-01").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "startdate in the future (start_date: 2999-01-01)");

        let (status, _) = get_json(app(), "/ads?cid=1&startdate=01/02/2020").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_json(app(), "/lighthouse?url=ftp%3A%2F%2Fa.com").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn not_found_upstream_is_acknowledged_with_cause() {
        let sink = Arc::new(MemorySink::new());
        let app = test_app(
            source("ADS", ads_report),
            source("LH", || Err(upstream(FetchFailureKind::NotFound))),
            sink.clone(),
        );
        let (status, body) = get_json(app, "/lighthouse?url=https%3A%2F%2Fgone.example.com").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cause"], "LH");
        assert_eq!(body["code"], "UPSTREAM_NOT_FOUND");
        assert_eq!(body["error"], "Lighthouse returned error (Status code: 404)");
        assert_eq!(sink.calls().await, 0);
    }

    #[tokio::test]
    async fn quota_and_transient_upstream_failures_are_retried() {
        let app = test_app(
            source("ADS", || Err(upstream(FetchFailureKind::QuotaExceeded))),
            source("LH", audit_report),
            Arc::new(MemorySink::new()),
        );
        let (status, body) = get_json(app, "/ads?cid=1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "UPSTREAM_QUOTA_EXCEEDED");
        assert_eq!(body["cause"], "ADS");

        let app = test_app(
            source("ADS", || Err(SourceError::Malformed("CSV record 3: bad".into()))),
            source("LH", audit_report),
            Arc::new(MemorySink::new()),
        );
        let (status, body) = get_json(app, "/ads?cid=1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "UPSTREAM_FAILURE");
    }

    #[tokio::test]
    async fn secret_and_warehouse_failures_name_their_cause() {
        let app = test_app(
            source("ADS", ads_report),
            source("LH", || Err(SourceError::Secret(SecretError::Lookup("timeout".into())))),
            Arc::new(MemorySink::new()),
        );
        let (status, body) = get_json(app, "/lighthouse?url=https%3A%2F%2Fa.com").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["cause"], "SECRETS");
        assert_eq!(body["code"], "SECRET_UNAVAILABLE");

        let partial = Arc::new(MemorySink::rejecting(SinkError::RowErrors(vec![RowInsertError {
            index: 0,
            messages: vec!["invalid: no such field".into()],
        }])));
        let app = test_app(source("ADS", ads_report), source("LH", audit_report), partial);
        let (status, body) = get_json(app, "/ads?cid=1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["cause"], "BQ");
        assert_eq!(body["code"], "WAREHOUSE_PARTIAL_FAILURE");

        let hard = Arc::new(MemorySink::rejecting(SinkError::Request("403: denied".into())));
        let app = test_app(source("ADS", ads_report), source("LH", audit_report), hard);
        let (status, body) = get_json(app, "/ads?cid=1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "WAREHOUSE_FAILURE");
        assert!(!body["error"].as_str().unwrap().contains("403"));
    }

    #[tokio::test]
    async fn unknown_paths_get_the_default_text() {
        let resp = happy_app(Arc::new(MemorySink::new()))
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(String::from_utf8(body.to_vec()).unwrap(), FALLBACK_TEXT);
    }

    #[test]
    fn every_error_kind_has_a_status() {
        let cases = [
            (PipelineError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                PipelineError::UpstreamTransientFailure { cause: "ADS", message: "x".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                PipelineError::ReportMalformed { cause: "LH", message: "x".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (PipelineError::WarehouseHardFailure("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status);
            assert_eq!(err.is_retriable(), status.is_server_error());
        }
    }
}
