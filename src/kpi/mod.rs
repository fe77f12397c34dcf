//! KPI Aggregator
//!
//! Rolls flag results into per-period summaries. Aggregation is a pure
//! function of its inputs, so rebuilding a summary always gives the same
//! result. Periods without data still get a zero-count summary, which keeps
//! gaps visible on a chart.

pub mod period;
pub mod trend;

pub use period::{periods_between, Interval, Period};
pub use trend::{linear_trend, rolling_average, TrendLine, TrendOptions};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::types::{FlagResult, FlagStatus, GroupKey};

/// Number of results per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub in_control: usize,
    pub warning: usize,
    pub out_of_control: usize,
    pub out_of_tolerance: usize,
    pub trend_violation: usize,
    pub unestablished: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: FlagStatus) {
        *self.slot(status) += 1;
    }

    pub const fn get(&self, status: FlagStatus) -> usize {
        match status {
            FlagStatus::InControl => self.in_control,
            FlagStatus::Warning => self.warning,
            FlagStatus::OutOfControl => self.out_of_control,
            FlagStatus::OutOfTolerance => self.out_of_tolerance,
            FlagStatus::TrendViolation => self.trend_violation,
            FlagStatus::Unestablished => self.unestablished,
        }
    }

    fn slot(&mut self, status: FlagStatus) -> &mut usize {
        match status {
            FlagStatus::InControl => &mut self.in_control,
            FlagStatus::Warning => &mut self.warning,
            FlagStatus::OutOfControl => &mut self.out_of_control,
            FlagStatus::OutOfTolerance => &mut self.out_of_tolerance,
            FlagStatus::TrendViolation => &mut self.trend_violation,
            FlagStatus::Unestablished => &mut self.unestablished,
        }
    }

    pub const fn total(&self) -> usize {
        self.established() + self.unestablished
    }

    /// Results evaluated against limits.
    pub const fn established(&self) -> usize {
        self.in_control + self.warning + self.out_of_control + self.out_of_tolerance + self.trend_violation
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSummary {
    pub group: GroupKey,
    pub period: Period,
    pub label: String,
    pub counts: StatusCounts,
    pub total: usize,
    /// in_control / established evaluations, as a percentage
    pub pct_in_control: Option<f64>,
    pub mean: Option<f64>,
    pub variance: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Set when a quality goal is configured and `pct_in_control` exists
    pub meets_goal: Option<bool>,
    pub flags: Vec<FlagResult>,
}

impl KpiSummary {
    #[must_use]
    pub fn with_goal(mut self, goal_pct: Option<f64>) -> Self {
        self.meets_goal = match (goal_pct, self.pct_in_control) {
            (Some(goal), Some(pct)) => Some(pct >= goal),
            _ => None,
        };
        self
    }
}

/// Summarize the flags of `group` that fall inside `period`.
///
/// Flags of other groups or outside the period are ignored, so the whole
/// flag list of a batch can be passed in.
#[allow(clippy::cast_precision_loss)]
pub fn aggregate(group: &GroupKey, period: Period, flag_results: &[FlagResult]) -> KpiSummary {
    let flags: Vec<FlagResult> = flag_results
        .iter()
        .filter(|f| {
            f.record.machine_id == group.machine_id
                && f.record.test_type == group.test_type
                && period.contains(f.record.timestamp)
        })
        .cloned()
        .collect();

    let mut counts = StatusCounts::default();
    for f in &flags {
        counts.record(f.status);
    }

    let values: Vec<f64> = flags.iter().map(|f| f.record.value).collect();
    let (mean, variance, min, max) = if values.is_empty() {
        (None, None, None, None)
    } else {
        let variance = Statistics::variance(&values);
        (
            Some(Statistics::mean(&values)),
            variance.is_finite().then_some(variance),
            Some(values.iter().copied().fold(f64::INFINITY, f64::min)),
            Some(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        )
    };

    let established = counts.established();
    let pct_in_control = (established > 0).then(|| counts.in_control as f64 / established as f64 * 100.0);

    KpiSummary {
        group: group.clone(),
        label: period.label(),
        period,
        total: counts.total(),
        counts,
        pct_in_control,
        mean,
        variance,
        min,
        max,
        meets_goal: None,
        flags,
    }
}

/// One summary per period of `interval` overlapping `[from, to]`, gaps included.
pub fn summarize(
    group: &GroupKey,
    interval: Interval,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    flags: &[FlagResult],
) -> Vec<KpiSummary> {
    periods_between(from, to, interval)
        .into_iter()
        .map(|period| aggregate(group, period, flags))
        .collect()
}

/// Period summaries with the derived chart series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSeries {
    pub group: GroupKey,
    pub interval: Interval,
    pub summaries: Vec<KpiSummary>,
    /// Trendline of percentage in-control, one value per summary
    pub trend: Option<TrendLine>,
    pub rolling_pct_in_control: Vec<Option<f64>>,
    pub goal_pct_in_control: Option<f64>,
}

/// Settings for [`build_series`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesOptions {
    pub interval: Interval,
    pub goal_pct_in_control: Option<f64>,
    pub rolling_window: usize,
}

impl Default for SeriesOptions {
    fn default() -> Self {
        Self {
            interval: Interval::default(),
            goal_pct_in_control: None,
            rolling_window: crate::config::defaults::ROLLING_WINDOW_PERIODS,
        }
    }
}

pub fn build_series(
    group: &GroupKey,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    flags: &[FlagResult],
    opts: &SeriesOptions,
) -> KpiSeries {
    let summaries: Vec<KpiSummary> = summarize(group, opts.interval, from, to, flags)
        .into_iter()
        .map(|s| s.with_goal(opts.goal_pct_in_control))
        .collect();
    let pct: Vec<Option<f64>> = summaries.iter().map(|s| s.pct_in_control).collect();

    KpiSeries {
        group: group.clone(),
        interval: opts.interval,
        trend: linear_trend(&pct, &TrendOptions::percentage()),
        rolling_pct_in_control: rolling_average(&pct, opts.rolling_window),
        goal_pct_in_control: opts.goal_pct_in_control,
        summaries,
    }
}
