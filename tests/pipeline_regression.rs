//! Pipeline Regression Tests
//!
//! End-to-end batch runs over synthetic QA series: limits establishment,
//! drift detection, tolerance precedence, refresh policies and period KPIs.

use qa_kpi::baseline::{RefreshPolicy, WindowSize};
use qa_kpi::config::{EngineConfig, ToleranceRule};
use qa_kpi::kpi::Interval;
use qa_kpi::pipeline::{run, BatchReport};
use qa_kpi::types::{FlagStatus, GroupKey, RawRow, RejectReason, SpcRule};

fn rows(machine: &str, test: &str, values: &[f64]) -> Vec<RawRow> {
    values
        .iter()
        .enumerate()
        .map(|(day, v)| {
            let date = chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + chrono::Duration::days(day as i64);
            RawRow::from_text(machine, test, &format!("{date}T08:00:00Z"), &format!("{v}"), "%")
        })
        .collect()
}

/// Alternating 99.8 / 100.2: mean 100, small spread.
fn stable(n: usize) -> Vec<f64> {
    (0..n).map(|i| if i % 2 == 0 { 99.8 } else { 100.2 }).collect()
}

fn key() -> GroupKey {
    GroupKey::new("LA1", "output_6x")
}

fn statuses(report: &BatchReport) -> Vec<FlagStatus> {
    report.groups[0].flags.iter().map(|f| f.status).collect()
}

#[test]
fn first_records_unestablished_then_limits_apply() {
    let report = run(&rows("LA1", "output_6x", &stable(30)), &EngineConfig::default()).unwrap();
    let flags = statuses(&report);
    assert!(flags[..10].iter().all(|s| *s == FlagStatus::Unestablished));
    assert!(flags[10..].iter().all(|s| *s == FlagStatus::InControl));

    // v1 at record 10, then every 5 records
    let history = report.limits(&key()).unwrap();
    let versions: Vec<u32> = history.iter().map(|l| l.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4]);
    assert!((history.version(1).unwrap().center - 100.0).abs() < 1e-9);
}

#[test]
fn slow_drift_is_flagged_as_trend() {
    let mut values = stable(20);
    // Rising from 100.11, above center even after the refresh at record 25
    values.extend((1..=8).map(|i| 100.1 + f64::from(i) * 0.01));
    let report = run(&rows("LA1", "output_6x", &values), &EngineConfig::default()).unwrap();
    let flags = &report.groups[0].flags;

    // Eight rising points: the eighth breaks the seven-point run rule
    assert!(flags[20..27].iter().all(|f| f.status != FlagStatus::TrendViolation));
    assert_eq!(flags[27].status, FlagStatus::TrendViolation);
    assert_eq!(flags[27].rule_triggered, Some(SpcRule::MonotonicTrend));
}

#[test]
fn tolerance_band_checked_before_control_limits() {
    let mut config = EngineConfig::default();
    config.tolerance.push(ToleranceRule {
        machine_id: None,
        test_type: "output_6x".to_string(),
        low: 98.0,
        high: 102.0,
    });

    let mut values = stable(20);
    values.push(102.5);
    values.push(102.0);
    let report = run(&rows("LA1", "output_6x", &values), &config).unwrap();
    let flags = &report.groups[0].flags;

    assert_eq!(flags[20].status, FlagStatus::OutOfTolerance);
    assert_eq!(flags[20].rule_triggered, Some(SpcRule::ToleranceBand));
    // The band is inclusive, so 102.0 falls through to the statistical check
    assert_eq!(flags[21].status, FlagStatus::OutOfControl);
    assert_eq!(flags[21].rule_triggered, Some(SpcRule::ControlLimit));
}

#[test]
fn fixed_policy_computes_once() {
    let mut config = EngineConfig::default();
    config.limits.refresh_policy = RefreshPolicy::Fixed;
    config.limits.baseline_window = WindowSize::Records(10);

    let report = run(&rows("LA1", "output_6x", &stable(40)), &config).unwrap();
    let history = report.limits(&key()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history.latest().unwrap().sample_count, 10);
    assert!(report.groups[0].flags[10..].iter().all(|f| f.limits_version == Some(1)));
}

#[test]
fn sparse_group_with_day_window_stays_unestablished() {
    let mut config = EngineConfig::default();
    config.limits.baseline_window = WindowSize::Days(30);

    // Weekly results: a 30-day window never holds ten of them
    let rows: Vec<RawRow> = (0..20)
        .map(|week| {
            let date = chrono::NaiveDate::from_ymd_opt(2025, 1, 6).unwrap() + chrono::Duration::weeks(week);
            RawRow::from_text("LA1", "output_6x", &format!("{date}"), "100.0", "%")
        })
        .collect();
    let report = run(&rows, &config).unwrap();
    assert_eq!(report.unestablished_groups(), vec![&key()]);
    assert!(statuses(&report).iter().all(|s| *s == FlagStatus::Unestablished));
    assert!(report.failed_groups.is_empty());
}

#[test]
fn quarterly_kpis_with_goal() {
    let mut config = EngineConfig::default();
    config.kpi.interval = Interval::Quarter;
    config.kpi.goal_pct_in_control = Some(90.0);

    let report = run(&rows("LA1", "output_6x", &stable(200)), &config).unwrap();
    let series = &report.groups[0].series;
    let labels: Vec<&str> = series.summaries.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["Q1 2025", "Q2 2025", "Q3 2025"]);

    let total: usize = series.summaries.iter().map(|s| s.total).sum();
    assert_eq!(total, 200);
    assert_eq!(series.summaries[0].counts.unestablished, 10);
    assert!(series.summaries.iter().all(|s| s.meets_goal == Some(true)));
    assert_eq!(series.rolling_pct_in_control[2], Some(100.0));
}

#[test]
fn malformed_row_rejected_and_batch_continues() {
    let json = r#"[
        {"machine_id": "", "test_type": "output_6x", "timestamp": "2025-01-01", "value": "abc", "unit": "%"},
        {"machine_id": "LA1", "test_type": "output_6x", "timestamp": "2025-01-02", "value": 100.1, "unit": "%"},
        {"machine_id": "LA1", "test_type": "output_6x", "timestamp": "2025-01-03", "value": "99.9", "unit": "%"},
        {"machine_id": "LA1", "test_type": "output_6x", "timestamp": "2025-01-04", "value": 100.0, "unit": "cGy"}
    ]"#;
    let rows: Vec<RawRow> = serde_json::from_str(json).unwrap();
    let report = run(&rows, &EngineConfig::default()).unwrap();

    assert_eq!(report.record_count, 2);
    let reasons: Vec<RejectReason> = report.rejected.iter().map(|r| r.reason).collect();
    assert_eq!(reasons, vec![RejectReason::MissingMachineId, RejectReason::UnitMismatch]);
    assert_eq!(report.rejected[0].row_index, 0);
    assert_eq!(report.groups[0].record_count, 2);
}

#[test]
fn implausible_timestamp_rejected_without_stalling_batch() {
    let mut input = rows("LA1", "output_6x", &stable(12));
    input.insert(3, RawRow::from_text("LA1", "output_6x", "8210266876799000", "100.0", "%"));
    for interval in [Interval::Day, Interval::Month, Interval::Year] {
        let mut config = EngineConfig::default();
        config.kpi.interval = interval;
        let report = run(&input, &config).unwrap();
        assert_eq!(report.record_count, 12, "{interval}");
        assert_eq!(report.rejected[0].reason, RejectReason::UnparseableTimestamp);
        assert_eq!(report.rejected[0].row_index, 3);
        let total: usize = report.groups[0].series.summaries.iter().map(|s| s.total).sum();
        assert_eq!(total, 12, "{interval}");
    }
}

#[test]
fn machines_and_tests_are_independent_series() {
    let mut input = rows("LA1", "output_6x", &stable(15));
    input.extend(rows("LA1", "output_10x", &[101.0; 15]));
    input.extend(rows("LA2", "output_6x", &[95.0; 5]));
    let report = run(&input, &EngineConfig::default()).unwrap();

    let keys: Vec<String> = report.groups.iter().map(|g| g.key.to_string()).collect();
    assert_eq!(keys, vec!["LA1:output_10x", "LA1:output_6x", "LA2:output_6x"]);
    let ten_x = report.limits(&GroupKey::new("LA1", "output_10x")).unwrap().latest().unwrap();
    assert_eq!(ten_x.center, 101.0);
    assert_eq!(ten_x.upper_limit, 101.0);
    assert_eq!(report.unestablished_groups(), vec![&GroupKey::new("LA2", "output_6x")]);
}

#[test]
fn rerun_serializes_identically() {
    let mut input = rows("LA1", "output_6x", &stable(60));
    input.extend(rows("LA2", "output_6x", &stable(45)));
    let config = EngineConfig::default();
    let a = serde_json::to_string(&run(&input, &config).unwrap()).unwrap();
    let b = serde_json::to_string(&run(&input, &config).unwrap()).unwrap();
    assert_eq!(a, b);
}
