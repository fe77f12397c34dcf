//! Row normalization: raw rows → canonical measurement records
//!
//! Every row either becomes a [`MeasurementRecord`] or a [`RejectedRow`]
//! carrying the first check it failed. Checks, in order:
//!
//! - the reader could decode the row at all
//! - machine_id and test_type present and non-empty after trimming
//! - timestamp present, parseable and within years 1900..=9999
//! - value present, numeric and finite
//! - unit matches the unit fixed by the group's first accepted row

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use tracing::{debug, info, warn};

use crate::types::{GroupKey, MeasurementRecord, RawRow, RawValue, RejectReason, RejectedRow};

/// Epoch values above this are milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 10_000_000_000.0;

/// Years a QA result can plausibly carry. Periods are only computed for
/// timestamps inside this range.
const YEAR_RANGE: RangeInclusive<i32> = 1900..=9999;

/// Naive date-time layouts tried after RFC 3339, all read as UTC.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Date-only layouts, read as midnight UTC.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Split raw rows into accepted records and rejected rows.
///
/// Rows are indexed by their position in `rows`; that index becomes
/// `source_row` on records and `row_index` on rejections.
pub fn normalize(rows: &[RawRow]) -> (Vec<MeasurementRecord>, Vec<RejectedRow>) {
    let mut records = Vec::with_capacity(rows.len());
    let mut rejected = Vec::new();
    let mut group_units: HashMap<GroupKey, String> = HashMap::new();

    for (index, row) in rows.iter().enumerate() {
        match normalize_row(index, row, &mut group_units) {
            Ok(record) => records.push(record),
            Err((reason, detail)) => {
                debug!(row = index, reason = %reason, detail = %detail, "Row rejected");
                rejected.push(RejectedRow {
                    row_index: index,
                    reason,
                    detail,
                    row: row.clone(),
                });
            }
        }
    }

    if !rejected.is_empty() {
        let summary = RejectionSummary::from_rejected(&rejected);
        warn!(
            rejected = rejected.len(),
            accepted = records.len(),
            primary = summary.primary_reason.map_or("", RejectReason::code),
            "Rows rejected during normalization"
        );
    }
    info!(rows = rows.len(), accepted = records.len(), "Normalization complete");

    (records, rejected)
}

fn normalize_row(
    index: usize,
    row: &RawRow,
    group_units: &mut HashMap<GroupKey, String>,
) -> Result<MeasurementRecord, (RejectReason, String)> {
    if let Some(detail) = &row.malformed {
        return Err((RejectReason::MalformedRow, detail.clone()));
    }
    let machine_id = non_empty(row.machine_id.as_deref())
        .ok_or((RejectReason::MissingMachineId, "machine_id is missing or blank".to_string()))?;
    let test_type = non_empty(row.test_type.as_deref())
        .ok_or((RejectReason::MissingTestType, "test_type is missing or blank".to_string()))?;

    let timestamp = match &row.timestamp {
        None => return Err((RejectReason::MissingTimestamp, "timestamp is missing".to_string())),
        Some(RawValue::Text(s)) if s.trim().is_empty() => {
            return Err((RejectReason::MissingTimestamp, "timestamp is blank".to_string()))
        }
        Some(raw) => parse_timestamp(raw).map_err(|e| (RejectReason::UnparseableTimestamp, e))?,
    };

    let value = parse_value(row.value.as_ref())?;

    let unit = row.unit.as_deref().map(str::trim).unwrap_or_default().to_string();
    let key = GroupKey::new(machine_id, test_type);
    match group_units.get(&key) {
        Some(expected) if *expected != unit => {
            return Err((
                RejectReason::UnitMismatch,
                format!("unit '{unit}' differs from '{expected}' used by {key}"),
            ));
        }
        Some(_) => {}
        None => {
            group_units.insert(key.clone(), unit.clone());
        }
    }

    Ok(MeasurementRecord {
        machine_id: key.machine_id,
        test_type: key.test_type,
        timestamp,
        value,
        unit,
        source_row: index,
    })
}

fn non_empty(field: Option<&str>) -> Option<&str> {
    field.map(str::trim).filter(|s| !s.is_empty())
}

fn parse_value(raw: Option<&RawValue>) -> Result<f64, (RejectReason, String)> {
    let value = match raw {
        None => return Err((RejectReason::MissingValue, "value is missing".to_string())),
        Some(RawValue::Number(v)) => *v,
        Some(RawValue::Text(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Err((RejectReason::MissingValue, "value is blank".to_string()));
            }
            s.parse::<f64>()
                .map_err(|_| (RejectReason::NonNumericValue, format!("'{s}' is not a number")))?
        }
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err((RejectReason::NonFiniteValue, format!("{value} is not finite")))
    }
}

/// Parse a timestamp cell.
///
/// Numbers are Unix epoch seconds, or milliseconds above 10^10. Text may be
/// RFC 3339, a naive date-time (UTC), a date (midnight UTC) or an epoch.
pub fn parse_timestamp(raw: &RawValue) -> Result<DateTime<Utc>, String> {
    match raw {
        RawValue::Number(epoch) => parse_epoch(*epoch).and_then(within_year_range),
        RawValue::Text(s) => parse_timestamp_str(s),
    }
}

pub fn parse_timestamp_str(s: &str) -> Result<DateTime<Utc>, String> {
    parse_text(s).and_then(within_year_range)
}

fn within_year_range(ts: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    if YEAR_RANGE.contains(&ts.year()) {
        Ok(ts)
    } else {
        Err(format!(
            "{ts} is outside years {}..={}",
            YEAR_RANGE.start(),
            YEAR_RANGE.end()
        ))
    }
}

fn parse_text(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim().trim_matches('"');
    if s.is_empty() {
        return Err("empty timestamp".to_string());
    }

    if let Ok(epoch) = s.parse::<f64>() {
        return parse_epoch(epoch);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%:z") {
        return Ok(dt.with_timezone(&Utc));
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d.and_time(chrono::NaiveTime::MIN).and_utc());
        }
    }

    Err(format!("cannot parse timestamp '{s}'"))
}

#[allow(clippy::cast_possible_truncation)]
fn parse_epoch(epoch: f64) -> Result<DateTime<Utc>, String> {
    if !epoch.is_finite() {
        return Err(format!("epoch {epoch} is not finite"));
    }
    let millis = if epoch.abs() > EPOCH_MILLIS_THRESHOLD {
        epoch
    } else {
        epoch * 1000.0
    };
    DateTime::from_timestamp_millis(millis.round() as i64)
        .ok_or_else(|| format!("epoch {epoch} is out of range"))
}

// ============================================================================
// Rejection Summary
// ============================================================================

/// Rejection counts by reason, for logs and the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RejectionSummary {
    pub total: usize,
    pub by_reason: BTreeMap<RejectReason, usize>,
    /// Most frequent reason; ties go to the earlier check
    pub primary_reason: Option<RejectReason>,
}

impl RejectionSummary {
    pub fn from_rejected(rejected: &[RejectedRow]) -> Self {
        let mut by_reason = BTreeMap::new();
        for r in rejected {
            *by_reason.entry(r.reason).or_insert(0) += 1;
        }
        let primary_reason = by_reason
            .iter()
            .fold(None, |best: Option<(RejectReason, usize)>, (&reason, &count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((reason, count)),
            })
            .map(|(reason, _)| reason);
        Self {
            total: rejected.len(),
            by_reason,
            primary_reason,
        }
    }
}
