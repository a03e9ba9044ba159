//! HTTP surface of the dashboard.
//!
//! The store is loaded once and shared read-only; every request builds a
//! fresh `FilterSpec` and runs the pipeline to completion.

use crate::model::{
    describe_event, EventCategories, FilterError, FilterSpec, Granularity, IpCount, IpFilter,
    LogRecord, SeriesStats, SortColumn, SortOrder, TimeBucket, TimeRange,
};
use crate::pipeline::{sort_records, to_csv, ExportError, FilteredResult, Pipeline};
use crate::store::LogStore;
use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct AppState {
    store: Arc<LogStore>,
    // Event categories can be swapped at runtime through /api/config.
    categories: RwLock<EventCategories>,
    granularity: Granularity,
}

impl AppState {
    pub fn new(
        store: Arc<LogStore>,
        categories: EventCategories,
        granularity: Granularity,
    ) -> Self {
        Self {
            store,
            categories: RwLock::new(categories),
            granularity,
        }
    }

    fn pipeline(&self) -> Pipeline {
        let categories = self
            .categories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Pipeline::new(categories, self.granularity)
    }
}

/// Filter controls as sent by the frontend (and built by the `report` command).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterRequest {
    pub event_ids: Vec<String>,
    pub ips: Vec<String>,
    pub top_n: Option<usize>,
    pub ip_pattern: Option<String>,
    pub users: Vec<String>,
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
    pub sort: Option<SortColumn>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl FilterRequest {
    /// Builds the spec. A missing bound falls back to the dataset's edge,
    /// never past the bound that was given; only two explicit bounds in the
    /// wrong order are rejected.
    pub fn to_spec(&self, store: &LogStore) -> Result<FilterSpec, FilterError> {
        let span = store.time_span();
        let time_range = match (self.from, self.to) {
            (None, None) => None,
            (Some(start), Some(end)) => Some(TimeRange::new(start, end)?),
            (Some(start), None) => {
                let edge = span.map_or(NaiveDateTime::MAX, |s| s.end);
                Some(TimeRange {
                    start,
                    end: edge.max(start),
                })
            }
            (None, Some(end)) => {
                let edge = span.map_or(NaiveDateTime::MIN, |s| s.start);
                Some(TimeRange {
                    start: edge.min(end),
                    end,
                })
            }
        };

        Ok(FilterSpec {
            event_ids: self.event_ids.iter().cloned().collect(),
            ip: IpFilter {
                selected: self.ips.iter().cloned().collect(),
                top_n: self.top_n,
                pattern: self.ip_pattern.clone(),
            },
            users: self.users.iter().cloned().collect(),
            time_range,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct EventShare {
    pub event_id: String,
    pub description: &'static str,
    pub count: usize,
    pub share: f64,
}

#[derive(Debug, Serialize)]
pub struct DashboardView<'a> {
    pub total: usize,
    pub dataset_total: usize,
    pub coverage: f64,
    pub distinct_ip_count: usize,
    pub distinct_user_count: usize,
    pub failed_auth_count: usize,
    pub failed_auth_ratio: f64,
    pub break_in_count: usize,
    pub top_ips: Vec<IpCount>,
    pub event_types: Vec<EventShare>,
    pub granularity: Granularity,
    pub time_series: Vec<TimeBucket>,
    pub series_stats: Option<SeriesStats>,
    pub rows: Vec<&'a LogRecord>,
}

impl<'a> DashboardView<'a> {
    pub fn build(
        store: &LogStore,
        pipeline: &Pipeline,
        result: FilteredResult<'a>,
        request: &FilterRequest,
    ) -> Self {
        let event_types = result
            .event_type_counts
            .iter()
            .map(|c| EventShare {
                event_id: c.event_id.clone(),
                description: describe_event(&c.event_id),
                count: c.count,
                share: if result.total == 0 {
                    0.0
                } else {
                    c.count as f64 / result.total as f64
                },
            })
            .collect();

        let coverage = result.coverage(store);
        let failed_auth_ratio = result.failed_auth_ratio();
        let series_stats = result.series_stats();

        let mut rows = result.records;
        if let Some(column) = request.sort {
            sort_records(&mut rows, column, request.order);
        }
        if let Some(limit) = request.limit {
            rows.truncate(limit);
        }

        Self {
            total: result.total,
            dataset_total: store.len(),
            coverage,
            distinct_ip_count: result.distinct_ip_count,
            distinct_user_count: result.distinct_user_count,
            failed_auth_count: result.failed_auth_count,
            failed_auth_ratio,
            break_in_count: result.break_in_count,
            top_ips: result.top_ips,
            event_types,
            granularity: pipeline.granularity(),
            time_series: result.time_series,
            series_stats,
            rows,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventOption {
    pub event_id: String,
    pub description: &'static str,
}

#[derive(Debug, Serialize)]
pub struct OptionsView {
    pub event_ids: Vec<EventOption>,
    pub users: Vec<String>,
    pub ips: Vec<String>,
    pub span: Option<TimeRange>,
    pub total_records: usize,
    pub unparsed_timestamps: usize,
    pub year: i32,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl From<FilterError> for ApiError {
    fn from(err: FilterError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<ExportError> for ApiError {
    fn from(err: ExportError) -> Self {
        error!(error = ?err, "csv export failed");
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn router(state: Arc<AppState>, ui_dir: impl AsRef<Path>) -> Router {
    Router::new()
        .route("/api/options", get(get_options))
        .route("/api/dashboard", post(post_dashboard))
        .route("/api/export", post(post_export))
        .route("/api/config", post(update_config).get(get_config))
        .fallback_service(ServeDir::new(ui_dir.as_ref())) // Serve frontend
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(bind: &str, state: Arc<AppState>, ui_dir: &Path) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, ui_dir = %ui_dir.display(), "dashboard listening");

    axum::serve(listener, router(state, ui_dir)).await?;
    Ok(())
}

// Handlers

async fn get_options(State(state): State<Arc<AppState>>) -> Json<OptionsView> {
    let store = &state.store;
    let event_ids = store
        .distinct_event_ids()
        .into_iter()
        .map(|id| EventOption {
            event_id: id.to_string(),
            description: describe_event(id),
        })
        .collect();

    Json(OptionsView {
        event_ids,
        users: store.distinct_users().into_iter().map(String::from).collect(),
        ips: store.distinct_ips().into_iter().map(String::from).collect(),
        span: store.time_span(),
        total_records: store.len(),
        unparsed_timestamps: store.unparsed_timestamps(),
        year: store.year(),
    })
}

async fn post_dashboard(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FilterRequest>,
) -> Result<Response, ApiError> {
    let spec = request.to_spec(&state.store)?;
    let pipeline = state.pipeline();
    let result = pipeline.apply(&state.store, &spec);
    let view = DashboardView::build(&state.store, &pipeline, result, &request);
    Ok(Json(view).into_response())
}

async fn post_export(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FilterRequest>,
) -> Result<Response, ApiError> {
    let spec = request.to_spec(&state.store)?;
    let result = state.pipeline().apply(&state.store, &spec);
    let body = to_csv(&result)?;

    let filename = format!(
        "ssh_logs_filtered_{}.csv",
        Local::now().format("%Y%m%d_%H%M%S")
    );
    info!(rows = result.total, %filename, "filtered view exported");

    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, body).into_response())
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<EventCategories> {
    let categories = state
        .categories
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Json(categories)
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EventCategories>,
) -> Json<EventCategories> {
    info!(
        failure = ?payload.failure,
        intrusion = ?payload.intrusion,
        "event categories updated"
    );
    *state
        .categories
        .write()
        .unwrap_or_else(PoisonError::into_inner) = payload.clone();
    Json(payload)
}
