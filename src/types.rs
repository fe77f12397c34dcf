//! Shared data structures for the QA KPI engine
//!
//! Records flow through four phases:
//!
//! - **Acquisition**: [`RawRow`] → [`MeasurementRecord`] or [`RejectedRow`]
//! - **Baseline**: windows of records → [`ControlLimits`]
//! - **Flagging**: record + limits + history → [`FlagResult`]
//! - **KPI**: flags → `kpi::KpiSummary` per period

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// Phase 1: Raw input and canonical records
// ============================================================================

/// A loosely typed cell. Spreadsheets and JSON exports disagree on whether a
/// measurement is a number or a string, so both are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Untyped input row as it arrives from a spreadsheet, CSV export or JSON feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(default, alias = "machine", alias = "linac")]
    pub machine_id: Option<String>,
    #[serde(default, alias = "test", alias = "check")]
    pub test_type: Option<String>,
    #[serde(default, alias = "date", alias = "time")]
    pub timestamp: Option<RawValue>,
    #[serde(default, alias = "result", alias = "measurement")]
    pub value: Option<RawValue>,
    #[serde(default, alias = "units")]
    pub unit: Option<String>,
    /// Set by a reader when the row could not be decoded into fields
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub malformed: Option<String>,
}

impl RawRow {
    /// Build a row from text cells, the shape every CSV row arrives in.
    pub fn from_text(machine_id: &str, test_type: &str, timestamp: &str, value: &str, unit: &str) -> Self {
        Self {
            machine_id: Some(machine_id.to_string()),
            test_type: Some(test_type.to_string()),
            timestamp: Some(RawValue::from(timestamp)),
            value: Some(RawValue::from(value)),
            unit: Some(unit.to_string()),
            malformed: None,
        }
    }

    /// A placeholder for input that could not be decoded, kept so the
    /// normalizer rejects it with a reason instead of losing it.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            malformed: Some(detail.into()),
            ..Self::default()
        }
    }
}

/// Identifies one independent SPC series: a single test on a single machine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub machine_id: String,
    pub test_type: String,
}

impl GroupKey {
    pub fn new(machine_id: impl Into<String>, test_type: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            test_type: test_type.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine_id, self.test_type)
    }
}

/// A validated measurement. Never mutated after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub machine_id: String,
    pub test_type: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
    /// Index of the raw row this record was built from
    pub source_row: usize,
}

impl MeasurementRecord {
    pub fn group(&self) -> GroupKey {
        GroupKey::new(self.machine_id.clone(), self.test_type.clone())
    }

    /// Ordering used inside a group: time first, input position as tie-break.
    pub fn chronological(a: &Self, b: &Self) -> Ordering {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.source_row.cmp(&b.source_row))
    }
}

/// Why a raw row was turned away. Checks run in declaration order and the
/// first failure wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MalformedRow,
    MissingMachineId,
    MissingTestType,
    MissingTimestamp,
    UnparseableTimestamp,
    MissingValue,
    NonNumericValue,
    NonFiniteValue,
    UnitMismatch,
}

impl RejectReason {
    /// Stable machine-readable code
    pub const fn code(self) -> &'static str {
        match self {
            Self::MalformedRow => "malformed_row",
            Self::MissingMachineId => "missing_machine_id",
            Self::MissingTestType => "missing_test_type",
            Self::MissingTimestamp => "missing_timestamp",
            Self::UnparseableTimestamp => "unparseable_timestamp",
            Self::MissingValue => "missing_value",
            Self::NonNumericValue => "non_numeric_value",
            Self::NonFiniteValue => "non_finite_value",
            Self::UnitMismatch => "unit_mismatch",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A row that failed validation, kept so nothing disappears silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub row_index: usize,
    pub reason: RejectReason,
    pub detail: String,
    pub row: RawRow,
}

// ============================================================================
// Phase 2: Control limits
// ============================================================================

/// Externally mandated acceptable range, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceBand {
    pub low: f64,
    pub high: f64,
}

impl ToleranceBand {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && value <= self.high
    }
}

/// Bounds of the records a limits version was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceWindow {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub count: usize,
}

/// One version of a group's SPC limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlLimits {
    pub group: GroupKey,
    /// 1-based, strictly increasing per group
    pub version: u32,
    pub center: f64,
    pub std_dev: f64,
    pub upper_limit: f64,
    pub lower_limit: f64,
    pub upper_warning: f64,
    pub lower_warning: f64,
    pub tolerance_band: Option<ToleranceBand>,
    pub sample_count: usize,
    /// Timestamp of the last record in the source window
    pub computed_at: DateTime<Utc>,
    pub source_window: SourceWindow,
}

impl ControlLimits {
    /// Standardized distance from center, undefined for a flat baseline.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.std_dev > 0.0 {
            Some((value - self.center) / self.std_dev)
        } else {
            None
        }
    }
}

// ============================================================================
// Phase 3: Flags
// ============================================================================

/// Outcome of evaluating one record.
///
/// Ordered by severity: `OutOfTolerance > OutOfControl > TrendViolation >
/// Warning > InControl`. `Unestablished` sorts below everything because no
/// rule was evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagStatus {
    Unestablished,
    InControl,
    Warning,
    TrendViolation,
    OutOfControl,
    OutOfTolerance,
}

impl FlagStatus {
    pub const ALL: [Self; 6] = [
        Self::InControl,
        Self::Warning,
        Self::OutOfControl,
        Self::OutOfTolerance,
        Self::TrendViolation,
        Self::Unestablished,
    ];

    pub const fn severity(self) -> u8 {
        match self {
            Self::Unestablished => 0,
            Self::InControl => 1,
            Self::Warning => 2,
            Self::TrendViolation => 3,
            Self::OutOfControl => 4,
            Self::OutOfTolerance => 5,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unestablished => "unestablished",
            Self::InControl => "in_control",
            Self::Warning => "warning",
            Self::TrendViolation => "trend_violation",
            Self::OutOfControl => "out_of_control",
            Self::OutOfTolerance => "out_of_tolerance",
        }
    }
}

impl PartialOrd for FlagStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlagStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.severity().cmp(&other.severity())
    }
}

impl fmt::Display for FlagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unestablished => write!(f, "UNESTABLISHED"),
            Self::InControl => write!(f, "IN CONTROL"),
            Self::Warning => write!(f, "WARNING"),
            Self::TrendViolation => write!(f, "TREND"),
            Self::OutOfControl => write!(f, "OUT OF CONTROL"),
            Self::OutOfTolerance => write!(f, "OUT OF TOLERANCE"),
        }
    }
}

/// The rule that produced a non-nominal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpcRule {
    ToleranceBand,
    ControlLimit,
    WarningZone,
    MonotonicTrend,
    SameSideRun,
}

impl fmt::Display for SpcRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ToleranceBand => "tolerance_band",
            Self::ControlLimit => "control_limit",
            Self::WarningZone => "warning_zone",
            Self::MonotonicTrend => "monotonic_trend",
            Self::SameSideRun => "same_side_run",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagResult {
    pub record: MeasurementRecord,
    pub status: FlagStatus,
    pub rule_triggered: Option<SpcRule>,
    pub limits_version: Option<u32>,
    pub z_score: Option<f64>,
}

impl FlagResult {
    pub const fn unestablished(record: MeasurementRecord) -> Self {
        Self {
            record,
            status: FlagStatus::Unestablished,
            rule_triggered: None,
            limits_version: None,
            z_score: None,
        }
    }
}
