//! Axum JSON API over the query engine, consumed by chat front-ends.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cfpick_core::{Problem, RangeQuery, SelectionError, SelectionFlow, Tag};
use cfpick_query::{QueryEngine, RangeLimit};
use cfpick_storage::{CatalogStore, StoreError};
use cfpick_sync::{maybe_build_scheduler, SyncConfig, SyncJob};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cfpick-web";

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";

/// Upper bound on `limit` for `/problems/random`.
pub const MAX_SAMPLE_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub engine: QueryEngine,
    pub max_sample_limit: usize,
}

impl AppState {
    pub fn new(engine: QueryEngine) -> Self {
        Self {
            engine,
            max_sample_limit: MAX_SAMPLE_LIMIT,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RandomParams {
    tag: Option<String>,
    min: Option<String>,
    max: Option<String>,
    limit: Option<usize>,
}

impl RandomParams {
    /// Same validation a chat dialogue goes through; a missing `min` means 0 and
    /// a missing or blank `max` leaves the window open.
    fn into_range_query(self, max_limit: usize) -> Result<RangeQuery, SelectionError> {
        let limit = RangeLimit::clamp(self.limit, max_limit).0;
        let tag = self.tag.unwrap_or_default();
        let min = self.min.unwrap_or_else(|| "0".to_string());

        let mut flow = SelectionFlow::new().with_limit(limit);
        flow.choose_topic(&tag)?;
        flow.choose_min(&min)?;
        match self.max.filter(|m| !m.trim().is_empty()) {
            Some(max) => flow.choose_max(&max),
            None => flow.finish_without_max(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProblemView {
    #[serde(flatten)]
    problem: Problem,
    url: String,
    tags: Vec<String>,
}

enum ApiError {
    BadRequest(SelectionError),
    NotFound(String),
    Store(StoreError),
}

impl From<SelectionError> for ApiError {
    fn from(err: SelectionError) -> Self {
        Self::BadRequest(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            Self::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            Self::Store(err) => {
                error!(error = %err, "catalog query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "catalog unavailable".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/problems", get(problems_handler))
        .route("/problems/random", get(random_handler))
        .route("/problems/{contest_id}/{index}", get(problem_detail_handler))
        .route("/tags", get(tags_handler))
        .with_state(Arc::new(state))
}

/// Serves the API on `CFPICK_BIND_ADDR` and, when enabled, runs the catalog
/// sync on its cron schedule alongside it.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = CatalogStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening catalog store {}", config.database_url))?;

    let job = SyncJob::from_config(&config, store.clone())?;
    let mut scheduler = maybe_build_scheduler(&config, job).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting sync scheduler")?;
    }

    let bind_addr = std::env::var("CFPICK_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "serving catalog api");

    axum::serve(listener, app(AppState::new(QueryEngine::new(store))))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.shutdown().await.context("stopping sync scheduler")?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let problems = state.engine.store().count_problems().await?;
    Ok(Json(json!({ "status": "ok", "problems": problems })))
}

async fn problems_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Problem>>, ApiError> {
    let problems = match params.tag.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(tag) => state.engine.list_by_tag(tag).await?,
        None => state.engine.list_all().await?,
    };
    Ok(Json(problems))
}

async fn problem_detail_handler(
    State(state): State<Arc<AppState>>,
    Path((contest_id, index)): Path<(i64, String)>,
) -> Result<Json<ProblemView>, ApiError> {
    let problem = state
        .engine
        .get_by_key(contest_id, &index)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("problem {contest_id}{index}")))?;
    let tags = state
        .engine
        .store()
        .tags_for_problem(problem.id)
        .await?
        .into_iter()
        .map(|t| t.name)
        .collect();
    Ok(Json(ProblemView {
        url: problem.url(),
        problem,
        tags,
    }))
}

async fn random_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RandomParams>,
) -> Result<Json<Vec<Problem>>, ApiError> {
    let query = params.into_range_query(state.max_sample_limit)?;
    Ok(Json(state.engine.sample(&query).await?))
}

async fn tags_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Tag>>, ApiError> {
    Ok(Json(state.engine.list_tags().await?))
}
