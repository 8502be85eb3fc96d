//! Axum REST API for the job board.

use std::any::Any;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use jobboard_core::JobPosting;
use jobboard_storage::{CategoryStats, FilterOptions, JobFilters, JobStore, StoreError};
use jobboard_sync::{CategoryRegistry, FetchOutcome, FetchPipeline};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "jobboard-web";

const DEFAULT_PAGE: i64 = 1;
const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub environment: String,
    pub client_build_dir: PathBuf,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            environment: "development".to_string(),
            client_build_dir: PathBuf::from("./client/build"),
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            environment: std::env::var("APP_ENV").unwrap_or(defaults.environment),
            client_build_dir: std::env::var("CLIENT_BUILD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.client_build_dir),
        }
    }

    /// Production hands non-API paths to the client's entry document.
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    /// `None` when no provider key is configured; the trigger then answers 503.
    pub pipeline: Option<Arc<FetchPipeline>>,
    pub categories: Arc<CategoryRegistry>,
    pub config: WebConfig,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: JobStore, categories: Arc<CategoryRegistry>, config: WebConfig) -> Self {
        Self {
            store,
            pipeline: None,
            categories,
            config,
            started_at: Instant::now(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<FetchPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

/// Handler failures. The `Display` text is exactly what the client sees in
/// `{"error": ...}`; underlying causes are only logged.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Job not found")]
    JobNotFound,
    #[error("Route not found")]
    RouteNotFound,
    #[error("{context}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("Failed to fetch jobs")]
    FetchFailed(#[source] anyhow::Error),
    #[error("Job fetch already in progress")]
    FetchInProgress,
    #[error("Job fetching is disabled: RAPIDAPI_KEY is not configured")]
    FetchDisabled,
    #[error("Something went wrong!")]
    Panic,
}

impl ApiError {
    fn store(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { context, source }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::JobNotFound | Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::FetchInProgress => StatusCode::CONFLICT,
            Self::FetchDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store { .. } | Self::FetchFailed(_) | Self::Panic => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Store { context, source } => error!(error = %source, "{context}"),
            Self::FetchFailed(source) => error!(error = ?source, "manual job fetch failed"),
            _ => {}
        }
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Raw `/api/jobs` parameters. Kept as strings so malformed numbers fall back
/// to defaults instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
struct JobsQuery {
    category: Option<String>,
    location: Option<String>,
    employment_type: Option<String>,
    remote_only: Option<String>,
    search: Option<String>,
    salary_min: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

impl JobsQuery {
    fn page(&self) -> i64 {
        positive_or(self.page.as_deref(), DEFAULT_PAGE)
    }

    fn limit(&self) -> i64 {
        positive_or(self.limit.as_deref(), DEFAULT_LIMIT).min(MAX_LIMIT)
    }

    fn filters(&self) -> JobFilters {
        let (page, limit) = (self.page(), self.limit());
        JobFilters {
            category: self.category.clone(),
            location: self.location.clone(),
            employment_type: self.employment_type.clone(),
            remote_only: self.remote_only.as_deref() == Some("true"),
            search: self.search.clone(),
            salary_min: self.salary_min.as_deref().and_then(|v| v.trim().parse().ok()),
            limit: Some(limit),
            offset: Some((page - 1).saturating_mul(limit)),
        }
    }
}

fn positive_or(value: Option<&str>, default: i64) -> i64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[derive(Debug, Serialize)]
struct Pagination {
    page: i64,
    limit: i64,
    total: i64,
    #[serde(rename = "totalPages")]
    total_pages: i64,
}

#[derive(Debug, Serialize)]
struct JobsResponse {
    jobs: Vec<JobPosting>,
    pagination: Pagination,
}

#[derive(Debug, Serialize)]
struct CategorySummary<'a> {
    name: &'a str,
    description: &'a str,
}

pub fn app(state: AppState) -> Router {
    let router = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/test", get(test_handler))
        .route("/api/keepalive", get(keepalive_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/jobs/{id}", get(job_detail_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/filters", get(filters_handler))
        .route("/api/categories", get(categories_handler))
        .route("/api/fetch-jobs", post(fetch_jobs_handler))
        .fallback(fallback_handler)
        .with_state(Arc::new(state));
    with_middleware(router)
}

fn with_middleware(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("non-string panic payload");
    error!(detail, "request handler panicked");
    ApiError::Panic.into_response()
}

pub async fn serve(
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let port = state.config.port;
    let environment = state.config.environment.clone();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, %environment, "server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving http")?;
    Ok(())
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "timestamp": timestamp(),
        "environment": state.config.environment,
    }))
}

async fn test_handler() -> Json<Value> {
    Json(json!({ "message": "API is working", "timestamp": timestamp() }))
}

async fn keepalive_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "alive",
        "timestamp": timestamp(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let filters = query.filters();
    let jobs = state
        .store
        .query(&filters)
        .await
        .map_err(ApiError::store("Failed to fetch jobs"))?;
    let total = state
        .store
        .count(&filters.without_pagination())
        .await
        .map_err(ApiError::store("Failed to fetch jobs"))?;

    let limit = query.limit();
    Ok(Json(JobsResponse {
        jobs,
        pagination: Pagination {
            page: query.page(),
            limit,
            total,
            total_pages: total / limit + i64::from(total % limit != 0),
        },
    }))
}

async fn job_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobPosting>, ApiError> {
    state
        .store
        .get_by_id(&id)
        .await
        .map_err(ApiError::store("Failed to fetch job"))?
        .map(Json)
        .ok_or(ApiError::JobNotFound)
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CategoryStats>>, ApiError> {
    let stats = state
        .store
        .aggregate_stats()
        .await
        .map_err(ApiError::store("Failed to fetch statistics"))?;
    Ok(Json(stats))
}

async fn filters_handler(State(state): State<Arc<AppState>>) -> Result<Json<FilterOptions>, ApiError> {
    let options = state
        .store
        .filter_options()
        .await
        .map_err(ApiError::store("Failed to fetch filter options"))?;
    Ok(Json(options))
}

async fn categories_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let categories = state
        .categories
        .categories
        .iter()
        .map(|c| CategorySummary {
            name: &c.name,
            description: &c.description,
        })
        .collect::<Vec<_>>();
    Json(json!(categories))
}

async fn fetch_jobs_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let pipeline = state.pipeline.as_ref().ok_or(ApiError::FetchDisabled)?;
    info!("manual job fetch triggered");
    match pipeline.run_full_fetch().await.map_err(ApiError::FetchFailed)? {
        FetchOutcome::Completed(report) => Ok(Json(json!({
            "message": "Job fetch completed",
            "result": report.summary,
        }))),
        FetchOutcome::AlreadyRunning => Err(ApiError::FetchInProgress),
    }
}

async fn fallback_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let path = request.uri().path();
    let is_api = path == "/api" || path.starts_with("/api/");
    if is_api || !state.config.is_production() {
        return ApiError::RouteNotFound.into_response();
    }

    let index = state.config.client_build_dir.join("index.html");
    match tokio::fs::read_to_string(&index).await {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            warn!(path = %index.display(), error = %err, "client entry document unavailable");
            ApiError::RouteNotFound.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use jobboard_adapters::{AdapterContext, AdapterError, JobSearchSource, RawJob};
    use jobboard_storage::{RequestBudget, RequestBudgetConfig};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;
    use tower::ServiceExt;

    async fn test_state() -> (TempDir, AppState) {
        let dir = tempdir().unwrap();
        let store = JobStore::open(dir.path().join("jobs.db")).await.unwrap();
        let state = AppState::new(
            store,
            Arc::new(CategoryRegistry::builtin().unwrap()),
            WebConfig::default(),
        );
        (dir, state)
    }

    fn posting(job_id: &str, category: &str, day: u32) -> JobPosting {
        JobPosting {
            job_id: job_id.to_string(),
            title: format!("{category} Intern"),
            company: "Brookings Institution".to_string(),
            location: "Washington, DC".to_string(),
            description: "Research support".to_string(),
            employment_type: "Internship".to_string(),
            currency: "USD".to_string(),
            category: category.to_string(),
            posted_date: Some(format!("2026-03-{day:02}T00:00:00.000Z")),
            experience_level: "Entry-level".to_string(),
            education_level: "Bachelor's".to_string(),
            ..Default::default()
        }
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        send(app, "GET", uri).await
    }

    #[tokio::test]
    async fn health_reports_environment() {
        let (_dir, state) = test_state().await;
        let (status, body) = get_json(app(state), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert_eq!(body["environment"], "development");
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn liveness_endpoints_answer() {
        let (_dir, state) = test_state().await;
        let router = app(state);

        let (status, body) = get_json(router.clone(), "/api/test").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "API is working");

        let (status, body) = get_json(router, "/api/keepalive").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");
        assert!(body["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn categories_list_names_and_descriptions() {
        let (_dir, state) = test_state().await;
        let (status, body) = get_json(app(state), "/api/categories").await;
        assert_eq!(status, StatusCode::OK);
        let categories = body.as_array().unwrap();
        assert_eq!(categories.len(), 8);
        assert_eq!(categories[2]["name"], "Law");
        assert_eq!(
            categories[2]["description"],
            "Legal positions, attorneys, legal counsel"
        );
        assert!(categories[2].get("search_phrases").is_none());
    }

    #[tokio::test]
    async fn jobs_paginate_within_a_category() {
        let (_dir, state) = test_state().await;
        for day in 1..=12 {
            state
                .store
                .upsert(&posting(&format!("law-{day:02}"), "Law", day))
                .await
                .unwrap();
        }
        for day in 1..=2 {
            state
                .store
                .upsert(&posting(&format!("dip-{day:02}"), "Diplomacy", day))
                .await
                .unwrap();
        }

        let (status, body) = get_json(app(state), "/api/jobs?category=Law&page=2&limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["page"], 2);
        assert_eq!(body["pagination"]["limit"], 5);
        assert_eq!(body["pagination"]["total"], 12);
        assert_eq!(body["pagination"]["totalPages"], 3);

        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 5);
        assert_eq!(jobs[0]["job_id"], "law-07");
        assert_eq!(jobs[4]["job_id"], "law-03");
        assert!(jobs.iter().all(|j| j["category"] == "Law"));
    }

    #[tokio::test]
    async fn malformed_paging_falls_back_to_defaults() {
        let (_dir, state) = test_state().await;
        state.store.upsert(&posting("law-01", "Law", 1)).await.unwrap();

        let (status, body) = get_json(app(state), "/api/jobs?page=abc&limit=-3&salary_min=lots").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["page"], 1);
        assert_eq!(body["pagination"]["limit"], 20);
        assert_eq!(body["pagination"]["total"], 1);
        assert_eq!(body["pagination"]["totalPages"], 1);
    }

    #[tokio::test]
    async fn oversized_paging_is_clamped() {
        let (_dir, state) = test_state().await;
        for day in 1..=3 {
            state
                .store
                .upsert(&posting(&format!("law-{day:02}"), "Law", day))
                .await
                .unwrap();
        }
        let router = app(state);

        let (status, body) = get_json(router.clone(), "/api/jobs?limit=9223372036854775807").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["limit"], MAX_LIMIT);
        assert_eq!(body["pagination"]["total"], 3);
        assert_eq!(body["pagination"]["totalPages"], 1);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 3);

        let (status, body) = get_json(
            router.clone(),
            "/api/jobs?page=3&limit=4611686018427387904",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["page"], 3);
        assert!(body["jobs"].as_array().unwrap().is_empty());

        let (status, body) = get_json(router, "/api/jobs?page=9223372036854775807").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["totalPages"], 1);
        assert!(body["jobs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_only_needs_literal_true() {
        let (_dir, state) = test_state().await;
        let mut remote = posting("remote-1", "Public Policy", 2);
        remote.remote_allowed = true;
        remote.location = "Remote".to_string();
        state.store.upsert(&remote).await.unwrap();
        state.store.upsert(&posting("onsite-1", "Public Policy", 1)).await.unwrap();
        let router = app(state);

        let (_, body) = get_json(router.clone(), "/api/jobs?remote_only=true").await;
        assert_eq!(body["pagination"]["total"], 1);
        assert_eq!(body["jobs"][0]["job_id"], "remote-1");

        let (_, body) = get_json(router, "/api/jobs?remote_only=yes").await;
        assert_eq!(body["pagination"]["total"], 2);
    }

    #[tokio::test]
    async fn job_detail_and_missing_job() {
        let (_dir, state) = test_state().await;
        state.store.upsert(&posting("law-01", "Law", 1)).await.unwrap();
        let router = app(state);

        let (status, body) = get_json(router.clone(), "/api/jobs/law-01").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job_id"], "law-01");
        assert!(body["id"].is_i64());

        let (status, body) = get_json(router, "/api/jobs/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Job not found");
    }

    #[tokio::test]
    async fn stats_and_filters_use_client_keys() {
        let (_dir, state) = test_state().await;
        let mut paid = posting("law-01", "Law", 1);
        paid.salary_min = Some(20);
        paid.salary_max = Some(30);
        state.store.upsert(&paid).await.unwrap();
        state.store.upsert(&posting("law-02", "Law", 2)).await.unwrap();
        let router = app(state);

        let (status, body) = get_json(router.clone(), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["category"], "Law");
        assert_eq!(body[0]["count"], 1);
        assert_eq!(body[0]["avg_salary_min"], 20.0);

        let (status, body) = get_json(router, "/api/filters").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["categories"][0]["value"], "Law");
        assert_eq!(body["categories"][0]["count"], 2);
        assert_eq!(body["employmentTypes"][0]["value"], "Internship");
        assert_eq!(body["locations"][0]["value"], "Washington, DC");
    }

    #[tokio::test]
    async fn storage_failure_maps_to_generic_500() {
        let (_dir, state) = test_state().await;
        state.store.close().await;
        let router = app(state);

        let (status, body) = get_json(router.clone(), "/api/stats").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch statistics");

        let (status, body) = get_json(router, "/api/jobs").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch jobs");
    }

    #[tokio::test]
    async fn unknown_routes_are_json_404() {
        let (_dir, state) = test_state().await;
        let router = app(state);

        let (status, body) = get_json(router.clone(), "/api/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Route not found");

        let (status, body) = get_json(router, "/dashboard").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Route not found");
    }

    #[tokio::test]
    async fn production_serves_client_entry_for_non_api_paths() {
        let (_dir, mut state) = test_state().await;
        let build = tempdir().unwrap();
        std::fs::write(build.path().join("index.html"), "<html>job board</html>").unwrap();
        state.config = WebConfig {
            environment: "production".to_string(),
            client_build_dir: build.path().to_path_buf(),
            ..WebConfig::default()
        };
        let router = app(state);

        let resp = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/jobs/some-client-route")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<html>job board</html>");

        let (status, body) = get_json(router, "/api/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Route not found");
    }

    #[tokio::test]
    async fn handler_panic_becomes_generic_500() {
        async fn boom() -> &'static str {
            panic!("handler exploded")
        }
        let router = with_middleware(Router::new().route("/boom", get(boom)));

        let (status, body) = get_json(router, "/boom").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Something went wrong!");
    }

    #[tokio::test]
    async fn fetch_trigger_disabled_without_pipeline() {
        let (_dir, state) = test_state().await;
        let (status, body) = send(app(state), "POST", "/api/fetch-jobs").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("disabled"));
    }

    #[derive(Default)]
    struct StubSource {
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    #[async_trait]
    impl JobSearchSource for StubSource {
        fn source_id(&self) -> &'static str {
            "stub"
        }

        async fn search(
            &self,
            ctx: &AdapterContext,
            query: &str,
        ) -> Result<Vec<RawJob>, AdapterError> {
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            Ok(vec![RawJob {
                job_id: Some(format!("{}-{}", ctx.category, query)),
                employer_name: Some("Harbor Legal Aid".into()),
                job_title: Some("Legal Intern".into()),
                job_city: Some("Boston".into()),
                job_state: Some("MA".into()),
                ..Default::default()
            }])
        }
    }

    fn law_pipeline(store: JobStore, source: StubSource) -> Arc<FetchPipeline> {
        let registry = CategoryRegistry::from_yaml_str(
            "categories:\n  - name: Law\n    description: Legal positions\n    search_phrases:\n      - legal internship\n",
        )
        .unwrap();
        let budget = RequestBudget::new(RequestBudgetConfig {
            min_interval: Duration::ZERO,
            ..Default::default()
        });
        Arc::new(FetchPipeline::new(
            store,
            Arc::new(source),
            Arc::new(budget),
            Arc::new(registry),
        ))
    }

    #[tokio::test]
    async fn fetch_trigger_runs_pipeline() {
        let (_dir, state) = test_state().await;
        let pipeline = law_pipeline(state.store.clone(), StubSource::default());
        let store = state.store.clone();
        let router = app(state.with_pipeline(pipeline));

        let (status, body) = send(router, "POST", "/api/fetch-jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Job fetch completed");
        assert_eq!(body["result"]["saved"], 1);
        assert_eq!(body["result"]["errors"], 0);

        let saved = store.get_by_id("Law-legal internship").await.unwrap().unwrap();
        assert_eq!(saved.location, "Boston, MA");
        assert_eq!(saved.category, "Law");
    }

    #[tokio::test]
    async fn overlapping_fetch_trigger_conflicts() {
        let (_dir, state) = test_state().await;
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let pipeline = law_pipeline(
            state.store.clone(),
            StubSource {
                gate: Some((entered.clone(), release.clone())),
            },
        );
        let router = app(state.with_pipeline(pipeline));

        let first = tokio::spawn(send(router.clone(), "POST", "/api/fetch-jobs"));
        entered.notified().await;

        let (status, body) = send(router, "POST", "/api/fetch-jobs").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Job fetch already in progress");

        release.notify_one();
        let (status, _) = first.await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }
}
