//! Response envelope for the read API.
//!
//! Success bodies are `{ "data": ..., "meta": ... }`; failures are
//! `{ "error": { "code", "message" }, "meta": ... }`. `meta` says which batch
//! and interval the data describes and whether it came from the in-memory
//! report or the sled store.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::kpi::Interval;
use crate::pipeline::BatchReport;
use crate::storage::StorageError;
use crate::types::GroupKey;

const API_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Batch,
    Store,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMeta {
    pub api_version: &'static str,
    pub served_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DataSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,
    /// Accepted records in the batch being served
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_records: Option<usize>,
}

impl ResponseMeta {
    /// Meta with no batch context, used for errors and static data.
    pub fn bare() -> Self {
        Self {
            api_version: API_VERSION,
            served_at: Utc::now(),
            source: None,
            interval: None,
            batch_records: None,
        }
    }

    pub fn batch(report: &BatchReport) -> Self {
        Self {
            source: Some(DataSource::Batch),
            interval: Some(report.interval),
            batch_records: Some(report.record_count),
            ..Self::bare()
        }
    }

    #[must_use]
    pub fn from_store(mut self) -> Self {
        self.source = Some(DataSource::Store);
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub meta: ResponseMeta,
}

impl<T: Serialize> ApiResponse<T> {
    pub const fn new(data: T, meta: ResponseMeta) -> Self {
        Self { data, meta }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, axum::Json(self)).into_response()
    }
}

/// Everything a handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No group {0}")]
    UnknownGroup(GroupKey),
    #[error("No stored limits for {0}")]
    NoStoredLimits(GroupKey),
    #[error("Invalid '{param}': {reason}")]
    InvalidParameter { param: &'static str, reason: String },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::UnknownGroup(_) | Self::NoStoredLimits(_) => StatusCode::NOT_FOUND,
            Self::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownGroup(_) => "UNKNOWN_GROUP",
            Self::NoStoredLimits(_) => "NO_STORED_LIMITS",
            Self::InvalidParameter { .. } => "INVALID_PARAMETER",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    meta: ResponseMeta,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Storage(_)) {
            tracing::error!(error = %self, "API request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
            meta: ResponseMeta::bare(),
        };
        (self.status(), axum::Json(body)).into_response()
    }
}
