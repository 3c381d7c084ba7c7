//! HTTP dashboard: upload, sample data, rendered analysis, JSON and CSV export.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analysis::{analyze, Analysis};
use crate::config::{AnalyzerSettings, ServerConfig};
use crate::export::{self, ExportError, Table};
use crate::filter::{EventFilter, FilterOptions};
use crate::ingest::{self, IngestError};
use crate::models::{EventRecord, IngestSummary};
use crate::render;

pub const SAMPLE_CSV: &str = include_str!("../data/sample_events.csv");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSource {
    Sample,
    Upload { filename: String },
}

impl DatasetSource {
    pub fn describe(&self) -> String {
        match self {
            DatasetSource::Sample => "sample dataset".to_string(),
            DatasetSource::Upload { filename } => format!("upload \"{filename}\""),
        }
    }
}

/// Raw events the dashboard is currently looking at. Only the records are
/// kept; every table is derived again on each request.
#[derive(Debug)]
pub struct Dataset {
    pub id: Uuid,
    pub source: DatasetSource,
    pub records: Vec<EventRecord>,
    pub summary: IngestSummary,
}

impl Dataset {
    pub fn parse(
        source: DatasetSource,
        bytes: &[u8],
        settings: &AnalyzerSettings,
    ) -> Result<Self, IngestError> {
        let ingested = ingest::read_events(bytes, &settings.stages)?;
        Ok(Self {
            id: Uuid::new_v4(),
            source,
            records: ingested.records,
            summary: ingested.summary,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<AnalyzerSettings>,
    sample: Arc<Dataset>,
    active: Arc<RwLock<Arc<Dataset>>>,
}

impl AppState {
    pub fn new(settings: AnalyzerSettings) -> anyhow::Result<Self> {
        let sample = Dataset::parse(DatasetSource::Sample, SAMPLE_CSV.as_bytes(), &settings)
            .context("built-in sample dataset does not match the configured stages")?;
        let sample = Arc::new(sample);
        Ok(Self {
            settings: Arc::new(settings),
            active: Arc::new(RwLock::new(sample.clone())),
            sample,
        })
    }

    pub async fn active(&self) -> Arc<Dataset> {
        self.active.read().await.clone()
    }

    async fn replace(&self, dataset: Arc<Dataset>) {
        *self.active.write().await = dataset;
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/upload", post(upload))
        .route("/load-sample", get(load_sample))
        .route("/dashboard", get(dashboard))
        .route("/api/analysis", get(api_analysis))
        .route("/export/funnel.csv", get(export_funnel))
        .route("/export/lift.csv", get(export_lift))
        .route("/export/anomalies.csv", get(export_anomalies))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(settings: AnalyzerSettings, server: &ServerConfig) -> anyhow::Result<()> {
    let state = AppState::new(settings)?;
    let app = router(state, server.max_upload_bytes);

    let addr: SocketAddr = server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", server.bind))?;

    info!(addr = %addr, "Starting dashboard server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Dashboard server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

fn analyze_filtered(
    dataset: &Dataset,
    filter: &EventFilter,
    settings: &AnalyzerSettings,
) -> Analysis {
    if filter.is_empty() {
        analyze(&dataset.records, settings)
    } else {
        analyze(&filter.apply(&dataset.records), settings)
    }
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let dataset = state.active().await;
    Html(render::upload_page(&dataset, None))
}

async fn upload_error(state: &AppState, status: StatusCode, message: String) -> Response {
    warn!(error = %message, "upload rejected");
    let dataset = state.active().await;
    (status, Html(render::upload_page(&dataset, Some(&message)))).into_response()
}

/// POST /upload — multipart field `file` holding a `.csv` file.
async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                let filename = field.file_name().unwrap_or_default().trim().to_string();
                match field.bytes().await {
                    Ok(bytes) => upload = Some((filename, bytes)),
                    Err(err) => {
                        return upload_error(&state, err.status(), err.body_text()).await;
                    }
                }
                break;
            }
            Ok(None) => break,
            Err(err) => return upload_error(&state, err.status(), err.body_text()).await,
        }
    }

    let Some((filename, bytes)) = upload else {
        return upload_error(&state, StatusCode::BAD_REQUEST, "No file uploaded.".to_string())
            .await;
    };
    if filename.is_empty() {
        return upload_error(
            &state,
            StatusCode::BAD_REQUEST,
            "Please choose a CSV file.".to_string(),
        )
        .await;
    }
    if !filename.to_lowercase().ends_with(".csv") {
        return upload_error(
            &state,
            StatusCode::BAD_REQUEST,
            "Only .csv files are supported.".to_string(),
        )
        .await;
    }

    let source = DatasetSource::Upload {
        filename: filename.clone(),
    };
    match Dataset::parse(source, &bytes, &state.settings) {
        Ok(dataset) => {
            info!(
                dataset_id = %dataset.id,
                filename = %filename,
                accepted = dataset.summary.rows_accepted,
                skipped = dataset.summary.rows_skipped,
                "dataset uploaded"
            );
            state.replace(Arc::new(dataset)).await;
            Redirect::to("/dashboard").into_response()
        }
        Err(err @ IngestError::MissingColumns(_)) => {
            upload_error(
                &state,
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Could not read CSV: {err}"),
            )
            .await
        }
        Err(err) => {
            upload_error(
                &state,
                StatusCode::BAD_REQUEST,
                format!("Could not read CSV: {err}"),
            )
            .await
        }
    }
}

async fn load_sample(State(state): State<AppState>) -> Redirect {
    state.replace(state.sample.clone()).await;
    info!("sample dataset loaded");
    Redirect::to("/dashboard")
}

async fn dashboard(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Html<String> {
    let dataset = state.active().await;
    let analysis = analyze_filtered(&dataset, &filter, &state.settings);
    let options = FilterOptions::from_records(&dataset.records);
    Html(render::dashboard_page(&dataset, &filter, &options, &analysis))
}

#[derive(Serialize)]
pub struct DatasetInfo {
    pub dataset_id: Uuid,
    pub source: DatasetSource,
    pub rows: usize,
}

impl DatasetInfo {
    fn of(dataset: &Dataset) -> Self {
        Self {
            dataset_id: dataset.id,
            source: dataset.source.clone(),
            rows: dataset.records.len(),
        }
    }
}

#[derive(Serialize)]
pub struct AnalysisResponse {
    pub dataset: DatasetInfo,
    pub filter: EventFilter,
    pub ingest: IngestSummary,
    pub analysis: Analysis,
}

/// GET /api/analysis — the dashboard's tables as JSON.
async fn api_analysis(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Json<AnalysisResponse> {
    let dataset = state.active().await;
    let analysis = analyze_filtered(&dataset, &filter, &state.settings);
    Json(AnalysisResponse {
        dataset: DatasetInfo::of(&dataset),
        filter,
        ingest: dataset.summary.clone(),
        analysis,
    })
}

async fn export_table(state: &AppState, filter: &EventFilter, table: Table) -> Response {
    let dataset = state.active().await;
    let analysis = analyze_filtered(&dataset, filter, &state.settings);
    let body: Result<String, ExportError> = match table {
        Table::Funnel => export::funnel_to_string(&analysis.funnel),
        Table::Lift => export::lift_to_string(&analysis.lift),
        Table::Anomalies => export::anomalies_to_string(&analysis.anomalies),
    };

    match body {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", table.download_name()),
                ),
            ],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, table = ?table, "CSV export failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "export failed").into_response()
        }
    }
}

async fn export_funnel(State(state): State<AppState>, Query(filter): Query<EventFilter>) -> Response {
    export_table(&state, &filter, Table::Funnel).await
}

async fn export_lift(State(state): State<AppState>, Query(filter): Query<EventFilter>) -> Response {
    export_table(&state, &filter, Table::Lift).await
}

async fn export_anomalies(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Response {
    export_table(&state, &filter, Table::Anomalies).await
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(flatten)]
    pub dataset: DatasetInfo,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let dataset = state.active().await;
    Json(HealthResponse {
        status: "healthy".to_string(),
        dataset: DatasetInfo::of(&dataset),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const BOUNDARY: &str = "X-DASHBOARD-BOUNDARY";

    fn state() -> AppState {
        AppState::new(AnalyzerSettings::default()).unwrap()
    }

    fn app(state: AppState) -> Router {
        router(state, 1024 * 1024)
    }

    fn multipart_request(filename: &str, content: &str) -> Request<Body> {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: text/csv\r\n\r\n\
             {content}\r\n\
             --{BOUNDARY}--\r\n"
        );
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn fetch(app: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    const SCENARIO: &str = "date,cohort,stage,count\n\
                            2024-05-01,control,impression,100\n\
                            2024-05-01,control,click,50\n\
                            2024-05-01,control,apply,25\n\
                            2024-05-01,control,approve,10\n\
                            2024-05-01,test,impression,100\n\
                            2024-05-01,test,click,60\n\
                            2024-05-01,test,apply,30\n\
                            2024-05-01,test,approve,15\n";

    #[test]
    fn sample_dataset_parses_cleanly() {
        let state = state();
        assert!(!state.sample.records.is_empty());
        assert!(state.sample.summary.is_clean());
        assert_eq!(state.sample.source, DatasetSource::Sample);
    }

    #[tokio::test]
    async fn index_and_dashboard_render() {
        let state = state();
        let (status, _, body) = fetch(app(state.clone()), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<form"));

        let (status, _, body) = fetch(app(state), "/dashboard?cohort=all&start_date=").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Funnel"));
        assert!(body.contains("chart.js"));
    }

    #[tokio::test]
    async fn upload_replaces_active_dataset() {
        let state = state();
        let response = app(state.clone())
            .oneshot(multipart_request("events.csv", SCENARIO))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/dashboard");

        let active = state.active().await;
        assert_eq!(active.records.len(), 8);
        assert_eq!(
            active.source,
            DatasetSource::Upload {
                filename: "events.csv".into()
            }
        );

        let (status, _, body) = fetch(app(state.clone()), "/api/analysis").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let approve = &json["analysis"]["lift"][3];
        assert_eq!(approve["stage"], "approve");
        assert!((approve["relative_lift"].as_f64().unwrap() - 0.25).abs() < 1e-9);

        let response = app(state.clone())
            .oneshot(Request::builder().uri("/load-sample").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(state.active().await.source, DatasetSource::Sample);
    }

    #[tokio::test]
    async fn rejects_non_csv_uploads() {
        let state = state();
        let response = app(state.clone())
            .oneshot(multipart_request("events.txt", SCENARIO))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("Only .csv files are supported."));
        assert_eq!(state.active().await.source, DatasetSource::Sample);
    }

    #[tokio::test]
    async fn missing_columns_are_unprocessable() {
        let state = state();
        let response = app(state)
            .oneshot(multipart_request("bad.csv", "date,cohort\n2024-05-01,test\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("stage, count"));
    }

    #[tokio::test]
    async fn exports_are_csv_attachments() {
        let state = state();
        app(state.clone())
            .oneshot(multipart_request("events.csv", SCENARIO))
            .await
            .unwrap();

        let (status, headers, body) = fetch(app(state.clone()), "/export/funnel.csv").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/csv; charset=utf-8");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"funnel_summary.csv\""
        );
        let rows = export::read_funnel_csv(body.as_bytes()).unwrap();
        assert_eq!(rows.len(), 8);

        let (_, _, body) = fetch(app(state.clone()), "/export/lift.csv?cohort=all").await;
        assert!(body.starts_with("stage,control_rate,test_rate,absolute_lift,relative_lift"));

        let (_, headers, body) = fetch(app(state.clone()), "/export/anomalies.csv").await;
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"daily_anomalies.csv\""
        );
        assert!(body.starts_with("date,metric_value"));

        let (_, _, body) = fetch(app(state), "/export/funnel.csv?cohort=test").await;
        let rows = export::read_funnel_csv(body.as_bytes()).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|row| row.cohort == "test"));
    }

    #[tokio::test]
    async fn health_reports_active_dataset() {
        let state = state();
        let active = state.active().await;
        let (status, _, body) = fetch(app(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["dataset_id"], active.id.to_string());
        assert_eq!(json["source"]["kind"], "sample");
        assert_eq!(json["rows"], active.records.len());
        assert!(json.get("dataset").is_none());
    }

    #[tokio::test]
    async fn bad_filter_dates_are_rejected() {
        let (status, _, _) = fetch(app(state()), "/dashboard?start_date=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
