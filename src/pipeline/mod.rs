//! Batch pipeline
//!
//! raw rows → normalize → group → (per group, in parallel) limits + flags →
//! period summaries → [`BatchReport`].
//!
//! Groups share nothing, so they are processed with rayon. A computation
//! failure in one group is recorded in `failed_groups` and the rest of the
//! batch carries on. Configuration errors stop the batch before any work.

mod query;

use chrono::{DateTime, NaiveTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::acquisition::{normalize, RejectionSummary};
use crate::baseline::{BaselineError, LimitTracker, LimitsHistory};
use crate::config::{ConfigError, EngineConfig, KpiConfig};
use crate::flagging::evaluate;
use crate::kpi::{build_series, Interval, KpiSeries, SeriesOptions, StatusCounts};
use crate::types::{FlagResult, FlagStatus, GroupKey, MeasurementRecord, RawRow, RejectedRow};

/// Everything computed for one (machine, test) group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupReport {
    pub key: GroupKey,
    pub unit: String,
    pub record_count: usize,
    pub limits: LimitsHistory,
    /// One per record, in chronological order
    pub flags: Vec<FlagResult>,
    pub series: KpiSeries,
}

impl GroupReport {
    pub fn is_established(&self) -> bool {
        !self.limits.is_empty()
    }

    pub fn latest_flag(&self) -> Option<&FlagResult> {
        self.flags.last()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for f in &self.flags {
            counts.record(f.status);
        }
        counts
    }
}

/// A group whose limits could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupFailure {
    pub key: GroupKey,
    pub record_count: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub input_rows: usize,
    pub record_count: usize,
    pub interval: Interval,
    /// Sorted by group key
    pub groups: Vec<GroupReport>,
    pub failed_groups: Vec<GroupFailure>,
    pub rejected: Vec<RejectedRow>,
    pub rejection_summary: RejectionSummary,
}

/// Validate `config`, then normalize and process `rows`.
pub fn run(rows: &[RawRow], config: &EngineConfig) -> Result<BatchReport, ConfigError> {
    config.validate()?;
    let (records, rejected) = normalize(rows);
    Ok(process_records(rows.len(), records, rejected, config))
}

/// Process already-normalized records. `config` is assumed valid.
pub fn process_records(
    input_rows: usize,
    records: Vec<MeasurementRecord>,
    rejected: Vec<RejectedRow>,
    config: &EngineConfig,
) -> BatchReport {
    let record_count = records.len();
    let grouped = group_records(records);
    info!(groups = grouped.len(), records = record_count, "Processing batch");

    let results: Vec<Result<GroupReport, GroupFailure>> = grouped
        .into_par_iter()
        .map(|(key, records)| {
            process_group(&key, &records, config).map_err(|e| {
                warn!(group = %key, error = %e, "Group failed, continuing with the rest of the batch");
                GroupFailure {
                    record_count: records.len(),
                    error: e.to_string(),
                    key,
                }
            })
        })
        .collect();

    let mut groups = Vec::new();
    let mut failed_groups = Vec::new();
    for result in results {
        match result {
            Ok(report) => groups.push(report),
            Err(failure) => failed_groups.push(failure),
        }
    }

    let unestablished = groups.iter().filter(|g| !g.is_established()).count();
    info!(
        groups = groups.len(),
        failed = failed_groups.len(),
        unestablished,
        rejected = rejected.len(),
        "Batch complete"
    );

    BatchReport {
        input_rows,
        record_count,
        interval: config.kpi.interval,
        groups,
        failed_groups,
        rejection_summary: RejectionSummary::from_rejected(&rejected),
        rejected,
    }
}

/// Split records by group, each group sorted by (timestamp, source_row).
fn group_records(records: Vec<MeasurementRecord>) -> Vec<(GroupKey, Vec<MeasurementRecord>)> {
    let mut map: BTreeMap<GroupKey, Vec<MeasurementRecord>> = BTreeMap::new();
    for record in records {
        map.entry(record.group()).or_default().push(record);
    }
    map.into_iter()
        .map(|(key, mut records)| {
            records.sort_by(MeasurementRecord::chronological);
            (key, records)
        })
        .collect()
}

/// Limits, flags and KPI series for one group.
///
/// `records` must belong to `key` and be in chronological order.
pub fn process_group(
    key: &GroupKey,
    records: &[MeasurementRecord],
    config: &EngineConfig,
) -> Result<GroupReport, BaselineError> {
    let mut tracker = LimitTracker::new(key.clone(), config.limit_schedule(), config.limit_method_for(key));
    let rules = config.run_rules();

    let mut flags = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        let limits = tracker.advance(records, i)?;
        let history = &records[i.saturating_sub(rules.history_len())..i];
        flags.push(evaluate(record, limits, history, &rules));
    }

    let unestablished = flags.iter().filter(|f| f.status == FlagStatus::Unestablished).count();
    if unestablished == flags.len() {
        info!(group = %key, records = records.len(), "Group has no established limits");
    }

    // An empty group gets an inverted range, which yields no periods
    let (from, to) = match (records.first(), records.last()) {
        (Some(first), Some(last)) => report_range(first.timestamp, last.timestamp, &config.kpi),
        _ => (DateTime::<Utc>::MAX_UTC, DateTime::<Utc>::MIN_UTC),
    };
    let series = build_series(key, from, to, &flags, &series_options(&config.kpi));

    Ok(GroupReport {
        key: key.clone(),
        unit: records.first().map(|r| r.unit.clone()).unwrap_or_default(),
        record_count: records.len(),
        limits: tracker.into_history(),
        flags,
        series,
    })
}

pub(crate) const fn series_options(kpi: &KpiConfig) -> SeriesOptions {
    SeriesOptions {
        interval: kpi.interval,
        goal_pct_in_control: kpi.goal_pct_in_control,
        rolling_window: kpi.rolling_window,
    }
}

/// Reporting range: configured dates, else the group's first and last record.
pub(crate) fn report_range(
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    kpi: &KpiConfig,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let from = kpi
        .report_start
        .map_or(first, |d| d.and_time(NaiveTime::MIN).and_utc());
    let to = kpi.report_end.map_or(last, |d| d.and_time(NaiveTime::MIN).and_utc());
    (from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RejectReason;

    fn rows(machine: &str, test: &str, values: &[f64]) -> Vec<RawRow> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                RawRow::from_text(
                    machine,
                    test,
                    &format!("2025-01-{:02}T08:00:00Z", i + 1),
                    &v.to_string(),
                    "%",
                )
            })
            .collect()
    }

    #[test]
    fn test_small_group_all_unestablished() {
        let report = run(&rows("LA1", "output_6x", &[100.0; 9]), &EngineConfig::default()).unwrap();
        let group = &report.groups[0];
        assert!(!group.is_established());
        assert!(group.flags.iter().all(|f| f.status == FlagStatus::Unestablished));
        assert_eq!(report.unestablished_groups(), vec![&group.key]);
    }

    #[test]
    fn test_groups_do_not_share_limits() {
        let mut input = rows("LA1", "output_6x", &[100.0; 12]);
        input.extend(rows("LA2", "output_6x", &[50.0; 12]));
        let report = run(&input, &EngineConfig::default()).unwrap();
        assert_eq!(report.groups.len(), 2);
        let la1 = report.limits(&GroupKey::new("LA1", "output_6x")).unwrap();
        let la2 = report.limits(&GroupKey::new("LA2", "output_6x")).unwrap();
        assert_eq!(la1.latest().unwrap().center, 100.0);
        assert_eq!(la2.latest().unwrap().center, 50.0);
    }

    #[test]
    fn test_rejected_rows_surface_and_valid_rows_processed() {
        let mut input = vec![RawRow {
            machine_id: Some(String::new()),
            value: Some("abc".into()),
            ..RawRow::default()
        }];
        input.extend(rows("LA1", "output_6x", &[100.0; 3]));
        let report = run(&input, &EngineConfig::default()).unwrap();
        assert_eq!(report.input_rows, 4);
        assert_eq!(report.record_count, 3);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].reason, RejectReason::MissingMachineId);
        assert_eq!(report.rejection_summary.total, 1);
    }

    #[test]
    fn test_invalid_config_stops_batch() {
        let mut config = EngineConfig::default();
        config.limits.sigma_out_of_control = 1.0;
        assert!(matches!(
            run(&rows("LA1", "output_6x", &[1.0]), &config),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_failing_group_isolated() {
        let mut input = rows("LA1", "output_6x", &[100.0; 12]);
        // Alternating extremes overflow the running mean
        let extremes: Vec<f64> = (0..12).map(|i| if i % 2 == 0 { f64::MAX } else { -f64::MAX }).collect();
        input.extend(rows("LA9", "broken", &extremes));

        let report = run(&input, &EngineConfig::default()).unwrap();
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].key, GroupKey::new("LA1", "output_6x"));
        assert_eq!(report.failed_groups.len(), 1);
        assert_eq!(report.failed_groups[0].key, GroupKey::new("LA9", "broken"));
        assert!(report.failed_groups[0].error.contains("Non-finite"));
    }

    #[test]
    fn test_out_of_order_rows_are_sorted() {
        let mut input = rows("LA1", "output_6x", &[100.0; 12]);
        input.reverse();
        let report = run(&input, &EngineConfig::default()).unwrap();
        let flags = &report.groups[0].flags;
        assert!(flags.windows(2).all(|w| w[0].record.timestamp <= w[1].record.timestamp));
        assert_eq!(flags[10].limits_version, Some(1));
    }

    #[test]
    fn test_rerun_is_identical() {
        let values: Vec<f64> = (0..28).map(|i| 100.0 + f64::from(i % 5) * 0.3).collect();
        let input = rows("LA1", "output_6x", &values);
        let config = EngineConfig::default();
        let a = run(&input, &config).unwrap();
        let b = run(&input, &config).unwrap();
        assert_eq!(a.groups, b.groups);
    }
}
