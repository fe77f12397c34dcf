//! Trend & Flagging Engine
//!
//! Judges each record against the limits in force and the group's recent
//! history. Checks run in severity order:
//!
//! 1. No limits: `unestablished`, nothing else is evaluated
//! 2. Outside the tolerance band: `out_of_tolerance`, short-circuits
//! 3. Outside the control limits: `out_of_control`; beyond the warning limits: `warning`
//! 4. Run rules over recent history: `trend_violation`
//!
//! The most severe candidate wins; among equals the first found is reported.

mod runs;

pub use runs::{monotonic_run, same_side_run};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::defaults;
use crate::types::{ControlLimits, FlagResult, FlagStatus, MeasurementRecord, SpcRule};

/// Run-rule thresholds. A run fires when it is longer than its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRules {
    pub trend_run_length: usize,
    pub same_side_run_length: usize,
}

impl Default for RunRules {
    fn default() -> Self {
        Self {
            trend_run_length: defaults::TREND_RUN_LENGTH,
            same_side_run_length: defaults::SAME_SIDE_RUN_LENGTH,
        }
    }
}

impl RunRules {
    /// Preceding records needed to detect the longest run.
    pub fn history_len(&self) -> usize {
        self.trend_run_length.max(self.same_side_run_length)
    }
}

/// Evaluate one record.
///
/// `limits` is the version in force (`None` while unestablished);
/// `recent_history` holds the group's preceding records, oldest first.
pub fn evaluate(
    record: &MeasurementRecord,
    limits: Option<&ControlLimits>,
    recent_history: &[MeasurementRecord],
    rules: &RunRules,
) -> FlagResult {
    let Some(limits) = limits else {
        return FlagResult::unestablished(record.clone());
    };

    let value = record.value;
    let (status, rule) = match limits.tolerance_band {
        Some(band) if !band.contains(value) => (FlagStatus::OutOfTolerance, Some(SpcRule::ToleranceBand)),
        _ => {
            let mut candidates = vec![statistical_status(value, limits)];
            if let Some(rule) = run_rule(record, limits.center, recent_history, rules) {
                candidates.push((FlagStatus::TrendViolation, Some(rule)));
            }
            most_severe(&candidates)
        }
    };

    if status > FlagStatus::InControl {
        debug!(
            group = %limits.group,
            row = record.source_row,
            value,
            status = %status,
            version = limits.version,
            "Record flagged"
        );
    }

    FlagResult {
        record: record.clone(),
        status,
        rule_triggered: rule,
        limits_version: Some(limits.version),
        z_score: limits.z_score(value),
    }
}

fn statistical_status(value: f64, limits: &ControlLimits) -> (FlagStatus, Option<SpcRule>) {
    if value > limits.upper_limit || value < limits.lower_limit {
        (FlagStatus::OutOfControl, Some(SpcRule::ControlLimit))
    } else if value > limits.upper_warning || value < limits.lower_warning {
        (FlagStatus::Warning, Some(SpcRule::WarningZone))
    } else {
        (FlagStatus::InControl, None)
    }
}

fn run_rule(
    record: &MeasurementRecord,
    center: f64,
    recent_history: &[MeasurementRecord],
    rules: &RunRules,
) -> Option<SpcRule> {
    let start = recent_history.len().saturating_sub(rules.history_len());
    let values: Vec<f64> = recent_history[start..]
        .iter()
        .map(|r| r.value)
        .chain(std::iter::once(record.value))
        .collect();

    if monotonic_run(&values, center) > rules.trend_run_length {
        Some(SpcRule::MonotonicTrend)
    } else if same_side_run(&values, center) > rules.same_side_run_length {
        Some(SpcRule::SameSideRun)
    } else {
        None
    }
}

fn most_severe(candidates: &[(FlagStatus, Option<SpcRule>)]) -> (FlagStatus, Option<SpcRule>) {
    candidates
        .iter()
        .copied()
        .fold((FlagStatus::InControl, None), |best, c| if c.0 > best.0 { c } else { best })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupKey, SourceWindow, ToleranceBand};
    use chrono::{Duration, TimeZone, Utc};

    fn record(i: usize, value: f64) -> MeasurementRecord {
        MeasurementRecord {
            machine_id: "LA1".to_string(),
            test_type: "output_6x".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 2, 1, 8, 0, 0).unwrap() + Duration::days(i as i64),
            value,
            unit: "%".to_string(),
            source_row: i,
        }
    }

    /// Limits centred at 100 with sigma 2: warning ±4, out-of-control ±6.
    fn limits(tolerance: Option<ToleranceBand>) -> ControlLimits {
        let t = Utc.with_ymd_and_hms(2025, 1, 31, 8, 0, 0).unwrap();
        ControlLimits {
            group: GroupKey::new("LA1", "output_6x"),
            version: 1,
            center: 100.0,
            std_dev: 2.0,
            upper_limit: 106.0,
            lower_limit: 94.0,
            upper_warning: 104.0,
            lower_warning: 96.0,
            tolerance_band: tolerance,
            sample_count: 20,
            computed_at: t,
            source_window: SourceWindow {
                first: t,
                last: t,
                count: 20,
            },
        }
    }

    fn eval(value: f64, lim: &ControlLimits) -> FlagResult {
        evaluate(&record(0, value), Some(lim), &[], &RunRules::default())
    }

    #[test]
    fn test_unestablished_without_limits() {
        let flag = evaluate(&record(0, 1e6), None, &[], &RunRules::default());
        assert_eq!(flag.status, FlagStatus::Unestablished);
        assert!(flag.rule_triggered.is_none());
        assert!(flag.limits_version.is_none());
    }

    #[test]
    fn test_statistical_bands() {
        let lim = limits(None);
        assert_eq!(eval(100.5, &lim).status, FlagStatus::InControl);
        assert_eq!(eval(104.0, &lim).status, FlagStatus::InControl);

        let warn = eval(105.0, &lim);
        assert_eq!(warn.status, FlagStatus::Warning);
        assert_eq!(warn.rule_triggered, Some(SpcRule::WarningZone));

        let ooc = eval(93.0, &lim);
        assert_eq!(ooc.status, FlagStatus::OutOfControl);
        assert_eq!(ooc.rule_triggered, Some(SpcRule::ControlLimit));
        assert_eq!(ooc.z_score, Some(-3.5));
        assert_eq!(ooc.limits_version, Some(1));
    }

    #[test]
    fn test_tolerance_takes_precedence() {
        // Statistically in control but outside the clinical band
        let lim = limits(Some(ToleranceBand::new(99.0, 101.0)));
        let flag = eval(101.5, &lim);
        assert_eq!(flag.status, FlagStatus::OutOfTolerance);
        assert_eq!(flag.rule_triggered, Some(SpcRule::ToleranceBand));

        // Band edges are inclusive
        assert_eq!(eval(101.0, &lim).status, FlagStatus::InControl);
    }

    #[test]
    fn test_monotonic_trend_fires_on_eighth_point() {
        let lim = limits(None);
        let history: Vec<MeasurementRecord> = (0..7).map(|i| record(i, 101.0 + i as f64 * 0.1)).collect();
        let current = record(7, 101.7);
        let flag = evaluate(&current, Some(&lim), &history, &RunRules::default());
        assert_eq!(flag.status, FlagStatus::TrendViolation);
        assert_eq!(flag.rule_triggered, Some(SpcRule::MonotonicTrend));

        // Seven points are not enough
        let flag = evaluate(&history[6], Some(&lim), &history[..6], &RunRules::default());
        assert_eq!(flag.status, FlagStatus::InControl);
    }

    #[test]
    fn test_same_side_run_fires_after_eight() {
        let lim = limits(None);
        let values = [101.0, 100.5, 101.2, 100.8, 101.1, 100.6, 101.3, 100.9];
        let history: Vec<MeasurementRecord> = values.iter().enumerate().map(|(i, &v)| record(i, v)).collect();
        let flag = evaluate(&record(8, 101.0), Some(&lim), &history, &RunRules::default());
        assert_eq!(flag.status, FlagStatus::TrendViolation);
        assert_eq!(flag.rule_triggered, Some(SpcRule::SameSideRun));
    }

    #[test]
    fn test_out_of_control_beats_trend() {
        let lim = limits(None);
        let history: Vec<MeasurementRecord> = (0..8).map(|i| record(i, 100.5 + i as f64 * 0.5)).collect();
        let flag = evaluate(&record(8, 107.0), Some(&lim), &history, &RunRules::default());
        assert_eq!(flag.status, FlagStatus::OutOfControl);
    }

    #[test]
    fn test_trend_beats_warning() {
        let lim = limits(None);
        let history: Vec<MeasurementRecord> = (0..7).map(|i| record(i, 100.5 + i as f64 * 0.5)).collect();
        // 104.5 is in the warning zone and completes an 8-point rise
        let flag = evaluate(&record(7, 104.5), Some(&lim), &history, &RunRules::default());
        assert_eq!(flag.status, FlagStatus::TrendViolation);
    }

    #[test]
    fn test_zero_sigma_limits() {
        let mut lim = limits(None);
        lim.std_dev = 0.0;
        lim.upper_limit = 100.0;
        lim.lower_limit = 100.0;
        lim.upper_warning = 100.0;
        lim.lower_warning = 100.0;
        let same = eval(100.0, &lim);
        assert_eq!(same.status, FlagStatus::InControl);
        assert!(same.z_score.is_none());
        assert_eq!(eval(100.1, &lim).status, FlagStatus::OutOfControl);
    }
}
