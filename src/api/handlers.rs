//! API route handlers
//!
//! All handlers read the latest [`BatchReport`]; nothing here mutates it.
//! Success goes out as [`ApiResponse`], failure as [`ApiError`].

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::envelope::{ApiError, ApiResponse, ResponseMeta};
use crate::acquisition::parse_timestamp_str;
use crate::config::EngineConfig;
use crate::kpi::{Interval, KpiSeries, KpiSummary, StatusCounts, TrendLine};
use crate::pipeline::{BatchReport, GroupReport};
use crate::storage::KpiStorage;
use crate::types::{FlagStatus, GroupKey};

// ============================================================================
// API State
// ============================================================================

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub report: Arc<RwLock<BatchReport>>,
    pub config: Arc<EngineConfig>,
    /// When set, limits are read from the persisted history
    pub storage: Option<KpiStorage>,
}

impl ApiState {
    pub fn new(report: BatchReport, config: EngineConfig) -> Self {
        Self {
            report: Arc::new(RwLock::new(report)),
            config: Arc::new(config),
            storage: None,
        }
    }

    #[must_use]
    pub fn with_storage(mut self, storage: KpiStorage) -> Self {
        self.storage = Some(storage);
        self
    }
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub groups: usize,
    pub records: usize,
    pub rejected: usize,
    pub failed_groups: usize,
    pub unestablished_groups: usize,
    /// On-disk size of the sled store, when one is attached
    pub store_bytes: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct GroupView {
    pub machine_id: String,
    pub test_type: String,
    pub unit: String,
    pub record_count: usize,
    pub established: bool,
    pub limits_version: Option<u32>,
    pub latest_status: Option<FlagStatus>,
    pub counts: StatusCounts,
}

impl From<&GroupReport> for GroupView {
    fn from(g: &GroupReport) -> Self {
        Self {
            machine_id: g.key.machine_id.clone(),
            test_type: g.key.test_type.clone(),
            unit: g.unit.clone(),
            record_count: g.record_count,
            established: g.is_established(),
            limits_version: g.limits.latest().map(|l| l.version),
            latest_status: g.latest_flag().map(|f| f.status),
            counts: g.status_counts(),
        }
    }
}

/// A period summary without its flag list.
#[derive(Debug, Serialize)]
pub struct SummaryView {
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub counts: StatusCounts,
    pub total: usize,
    pub pct_in_control: Option<f64>,
    pub mean: Option<f64>,
    pub variance: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub meets_goal: Option<bool>,
}

impl From<&KpiSummary> for SummaryView {
    fn from(s: &KpiSummary) -> Self {
        Self {
            label: s.label.clone(),
            start: s.period.start,
            end: s.period.end,
            counts: s.counts,
            total: s.total,
            pct_in_control: s.pct_in_control,
            mean: s.mean,
            variance: s.variance,
            min: s.min,
            max: s.max,
            meets_goal: s.meets_goal,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SeriesView {
    pub interval: Interval,
    pub summaries: Vec<SummaryView>,
    pub trend: Option<TrendLine>,
    pub rolling_pct_in_control: Vec<Option<f64>>,
    pub goal_pct_in_control: Option<f64>,
}

impl From<&KpiSeries> for SeriesView {
    fn from(s: &KpiSeries) -> Self {
        Self {
            interval: s.interval,
            summaries: s.summaries.iter().map(SummaryView::from).collect(),
            trend: s.trend.clone(),
            rolling_pct_in_control: s.rolling_pct_in_control.clone(),
            goal_pct_in_control: s.goal_pct_in_control,
        }
    }
}

// ============================================================================
// Query parameters
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

impl RangeQuery {
    fn parse(&self) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), ApiError> {
        let parse = |s: &Option<String>, param: &'static str| {
            s.as_deref()
                .map(parse_timestamp_str)
                .transpose()
                .map_err(|reason| ApiError::InvalidParameter { param, reason })
        };
        Ok((parse(&self.from, "from")?, parse(&self.to, "to")?))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SeriesQuery {
    pub interval: Option<String>,
}

type ApiResult = Result<Response, ApiError>;

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/health
pub async fn health(State(state): State<ApiState>) -> Response {
    let report = state.report.read().await;
    let health = HealthResponse {
        status: "ok",
        groups: report.groups.len(),
        records: report.record_count,
        rejected: report.rejected.len(),
        failed_groups: report.failed_groups.len(),
        unestablished_groups: report.unestablished_groups().len(),
        store_bytes: state.storage.as_ref().map(KpiStorage::size_bytes),
    };
    ApiResponse::new(health, ResponseMeta::batch(&report)).into_response()
}

/// GET /api/v1/groups
pub async fn groups(State(state): State<ApiState>) -> Response {
    let report = state.report.read().await;
    let views: Vec<GroupView> = report.groups.iter().map(GroupView::from).collect();
    ApiResponse::new(views, ResponseMeta::batch(&report)).into_response()
}

/// GET /api/v1/groups/:machine/:test/summaries?from=&to=
pub async fn summaries(
    State(state): State<ApiState>,
    Path((machine, test)): Path<(String, String)>,
    Query(q): Query<RangeQuery>,
) -> ApiResult {
    let (from, to) = q.parse()?;
    let key = GroupKey::new(machine, test);
    let report = state.report.read().await;
    let items = report.summaries(&key, from, to).ok_or(ApiError::UnknownGroup(key))?;
    let views: Vec<SummaryView> = items.into_iter().map(SummaryView::from).collect();
    Ok(ApiResponse::new(views, ResponseMeta::batch(&report)).into_response())
}

/// GET /api/v1/groups/:machine/:test/flags?from=&to=
pub async fn flags(
    State(state): State<ApiState>,
    Path((machine, test)): Path<(String, String)>,
    Query(q): Query<RangeQuery>,
) -> ApiResult {
    let (from, to) = q.parse()?;
    let key = GroupKey::new(machine, test);
    let report = state.report.read().await;
    let items = report.flags(&key, from, to).ok_or(ApiError::UnknownGroup(key))?;
    Ok(ApiResponse::new(items, ResponseMeta::batch(&report)).into_response())
}

/// GET /api/v1/groups/:machine/:test/limits
pub async fn limits(State(state): State<ApiState>, Path((machine, test)): Path<(String, String)>) -> ApiResult {
    let key = GroupKey::new(machine, test);
    let report = state.report.read().await;
    if let Some(storage) = &state.storage {
        let history = storage.limits_history(&key)?;
        if history.is_empty() {
            return Err(ApiError::NoStoredLimits(key));
        }
        return Ok(ApiResponse::new(history, ResponseMeta::batch(&report).from_store()).into_response());
    }
    let history = report.limits(&key).ok_or(ApiError::UnknownGroup(key))?;
    Ok(ApiResponse::new(history, ResponseMeta::batch(&report)).into_response())
}

/// GET /api/v1/groups/:machine/:test/series?interval=quarter
pub async fn series(
    State(state): State<ApiState>,
    Path((machine, test)): Path<(String, String)>,
    Query(q): Query<SeriesQuery>,
) -> ApiResult {
    let key = GroupKey::new(machine, test);
    let report = state.report.read().await;
    let interval = match q.interval.as_deref() {
        None => report.interval,
        Some(s) => s
            .parse::<Interval>()
            .map_err(|reason| ApiError::InvalidParameter { param: "interval", reason })?,
    };
    let series = report
        .series_at(&key, interval, &state.config.kpi)
        .ok_or(ApiError::UnknownGroup(key))?;
    let meta = ResponseMeta::batch(&report).with_interval(interval);
    Ok(ApiResponse::new(SeriesView::from(&series), meta).into_response())
}

/// GET /api/v1/rejected
pub async fn rejected(State(state): State<ApiState>) -> Response {
    let report = state.report.read().await;
    let body = serde_json::json!({
        "summary": report.rejection_summary,
        "rows": report.rejected,
    });
    ApiResponse::new(body, ResponseMeta::batch(&report)).into_response()
}

/// GET /api/v1/failures
pub async fn failures(State(state): State<ApiState>) -> Response {
    let report = state.report.read().await;
    ApiResponse::new(&report.failed_groups, ResponseMeta::batch(&report)).into_response()
}

/// GET /api/v1/config
pub async fn config(State(state): State<ApiState>) -> Response {
    ApiResponse::new(state.config.as_ref(), ResponseMeta::bare()).into_response()
}
