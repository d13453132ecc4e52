//! Axum control plane for billsync: JSON API plus an askama coverage page.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use billsync_core::{DateRange, EntityKind, OperationKey, SyncError, SyncMode};
use billsync_sync::{
    CoverageMark, MonthCoverage, SyncRuntime, SyncService, TieredScheduler, TriggerRequest, WindowSpec,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "billsync-web";

const DEFAULT_OPERATIONS_LIMIT: usize = 50;
const MAX_OPERATIONS_LIMIT: usize = 500;
const DEFAULT_COVERAGE_MONTHS: u32 = 12;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    pub scheduler: Option<Arc<TieredScheduler>>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self {
            service,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<TieredScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncBody {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    days_back_start: Option<u32>,
    days_back_end: Option<u32>,
    #[serde(default)]
    dry_run: bool,
    mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CancelBody {
    operation_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OperationsQuery {
    prefix: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct WindowQuery {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    days_back_start: Option<u32>,
    days_back_end: Option<u32>,
    #[serde(default)]
    deep: bool,
}

impl WindowQuery {
    fn range(&self, today: NaiveDate) -> Result<DateRange, SyncError> {
        WindowSpec::from_parts(self.start, self.end, self.days_back_start, self.days_back_end)?.resolve(today)
    }
}

#[derive(Debug, Default, Deserialize)]
struct CoverageQuery {
    kind: Option<String>,
    months: Option<u32>,
}

impl CoverageQuery {
    fn kind(&self) -> Result<Option<EntityKind>, SyncError> {
        self.kind
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .map(str::parse)
            .transpose()
    }

    fn months(&self) -> u32 {
        self.months.unwrap_or(DEFAULT_COVERAGE_MONTHS).clamp(1, 120)
    }
}

#[derive(Debug, Serialize)]
struct ApiOk<T> {
    success: bool,
    data: T,
}

#[derive(Debug, Serialize)]
struct ApiError {
    success: bool,
    message: String,
}

#[derive(Template)]
#[template(path = "coverage.html")]
struct CoverageTemplate {
    today: String,
    months: u32,
    rows: Vec<CoverageRow>,
}

#[derive(Debug, Clone)]
struct CoverageRow {
    month: String,
    kind: String,
    covered: bool,
    last_sync: String,
    last_validation: String,
}

impl From<&MonthCoverage> for CoverageRow {
    fn from(month: &MonthCoverage) -> Self {
        Self {
            month: month.month.clone(),
            kind: month.kind.as_str().to_string(),
            covered: month.is_covered(),
            last_sync: mark_text(month.last_sync.as_ref()),
            last_validation: mark_text(month.last_validation.as_ref()),
        }
    }
}

fn mark_text(mark: Option<&CoverageMark>) -> String {
    match mark {
        Some(mark) => {
            let verdict = match mark.validation_match {
                Some(true) => " match",
                Some(false) => " mismatch",
                None => "",
            };
            format!(
                "{}{} at {} ({})",
                mark.status.as_str(),
                verdict,
                mark.at.format("%Y-%m-%d %H:%M"),
                mark.operation_key
            )
        }
        None => "never".to_string(),
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sync/cancel", post(cancel_handler))
        .route("/api/sync/{kind}", post(trigger_handler))
        .route("/api/operations", get(operations_handler))
        .route("/api/operations/active", get(active_handler))
        .route("/api/scheduler/tiers", get(tiers_handler))
        .route("/api/validation/{kind}", get(validation_handler))
        .route("/api/drift/{kind}", get(drift_handler))
        .route("/api/coverage", get(coverage_handler))
        .route("/coverage", get(coverage_page_handler))
        .with_state(Arc::new(state))
}

/// Serves the control plane, with the tier scheduler running when enabled.
pub async fn serve(runtime: SyncRuntime) -> anyhow::Result<()> {
    let _scheduler = runtime.maybe_start_scheduler().await?;
    let port = runtime.config.web_port;
    let mut state = AppState::new(runtime.service.clone());
    if runtime.config.scheduler_enabled {
        state = state.with_scheduler(runtime.scheduler.clone());
    }
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "control plane listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = SyncRuntime::from_env().await?;
    runtime.store.migrate().await.context("running migrations")?;
    serve(runtime).await
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
    Json(body): Json<SyncBody>,
) -> Response {
    let request = match trigger_request(&kind, body) {
        Ok(request) => request,
        Err(err) => return api_error(err),
    };
    match state.service.trigger(request).await {
        Ok(outcome) => api_ok(outcome),
        Err(err) => api_error(err),
    }
}

fn trigger_request(kind: &str, body: SyncBody) -> Result<TriggerRequest, SyncError> {
    let kind: EntityKind = kind.parse()?;
    let window = WindowSpec::from_parts(body.start, body.end, body.days_back_start, body.days_back_end)?;
    let mode = body
        .mode
        .as_deref()
        .map(str::parse::<SyncMode>)
        .transpose()?
        .unwrap_or_default();
    Ok(TriggerRequest {
        kind,
        window,
        mode,
        dry_run: body.dry_run,
    })
}

/// An empty body cancels everything that is running.
async fn cancel_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let body: CancelBody = if body.iter().all(u8::is_ascii_whitespace) {
        CancelBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(err) => return api_error(SyncError::InvalidRequest(err.to_string())),
        }
    };
    let key = body
        .operation_key
        .filter(|k| !k.trim().is_empty())
        .map(OperationKey::from);
    let summary = state.service.cancel(key.as_ref());
    info!(cancelled = summary.cancelled.len(), "cancel requested");
    api_ok(summary)
}

async fn operations_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OperationsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_OPERATIONS_LIMIT)
        .clamp(1, MAX_OPERATIONS_LIMIT);
    api_ok(state.service.recent(query.prefix.as_deref(), limit))
}

async fn active_handler(State(state): State<Arc<AppState>>) -> Response {
    api_ok(state.service.active())
}

/// Empty when the tier scheduler is not running in this process.
async fn tiers_handler(State(state): State<Arc<AppState>>) -> Response {
    let tiers = state
        .scheduler
        .as_ref()
        .map(|scheduler| scheduler.status())
        .unwrap_or_default();
    api_ok(tiers)
}

async fn validation_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let args = kind
        .parse::<EntityKind>()
        .and_then(|kind| Ok((kind, query.range(state.service.today())?)));
    match args {
        Ok((kind, range)) => match state.service.validate(kind, range, query.deep).await {
            Ok(report) => api_ok(report),
            Err(err) => api_error(err),
        },
        Err(err) => api_error(err),
    }
}

async fn drift_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let args = kind
        .parse::<EntityKind>()
        .and_then(|kind| Ok((kind, query.range(state.service.today())?)));
    match args {
        Ok((kind, range)) => match state.service.drift(kind, range).await {
            Ok(report) => api_ok(report),
            Err(err) => api_error(err),
        },
        Err(err) => api_error(err),
    }
}

async fn coverage_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CoverageQuery>,
) -> Response {
    let kind = match query.kind() {
        Ok(kind) => kind,
        Err(err) => return api_error(err),
    };
    match state.service.coverage(kind, query.months()).await {
        Ok(months) => api_ok(months),
        Err(err) => api_error(err),
    }
}

async fn coverage_page_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CoverageQuery>,
) -> Response {
    let kind = match query.kind() {
        Ok(kind) => kind,
        Err(err) => return api_error(err),
    };
    let months = query.months();
    match state.service.coverage(kind, months).await {
        Ok(coverage) => render_html(CoverageTemplate {
            today: state.service.today().to_string(),
            months,
            rows: coverage.iter().map(CoverageRow::from).collect(),
        }),
        Err(err) => server_error(err),
    }
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::InvalidRequest(_) | SyncError::InvalidWindow(_) => StatusCode::BAD_REQUEST,
        SyncError::AlreadyRunning(_) | SyncError::Cancelled { .. } => StatusCode::CONFLICT,
        SyncError::SanityViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SyncError::Credential(_) | SyncError::UpstreamUnavailable(_) | SyncError::UpstreamRejected(_) => {
            StatusCode::BAD_GATEWAY
        }
        SyncError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_ok<T: Serialize>(data: T) -> Response {
    Json(ApiOk { success: true, data }).into_response()
}

fn api_error(err: SyncError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "control plane request failed");
    }
    (
        status,
        Json(ApiError {
            success: false,
            message: err.to_string(),
        }),
    )
        .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
