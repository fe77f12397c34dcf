//! Config Validation Tests
//!
//! Typo detection, range validation and the TOML load path, exercised
//! independently from the rest of the pipeline.

use qa_kpi::baseline::{RefreshPolicy, WindowSize};
use qa_kpi::config::validation::{known_config_keys, suggest_correction, validate_ranges, validate_unknown_keys};
use qa_kpi::config::{ConfigError, EngineConfig};
use qa_kpi::kpi::Interval;
use qa_kpi::types::GroupKey;

// ============================================================================
// Typo Detection
// ============================================================================

#[test]
fn typo_in_sigma_key_warns_with_suggestion() {
    let toml_str = r#"
[limits]
sigma_warnig = 2.5
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert_eq!(warnings.len(), 1, "Expected exactly 1 warning");
    assert!(warnings[0].field.contains("sigma_warnig"));
    assert_eq!(warnings[0].suggestion.as_deref(), Some("limits.sigma_warning"));
}

#[test]
fn typo_inside_tolerance_array_warns() {
    let toml_str = r#"
[[tolerance]]
test_type = "output_6x"
lowe = 98.0
high = 102.0
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].suggestion.as_deref(), Some("tolerance.low"));
}

#[test]
fn valid_config_produces_zero_warnings() {
    let toml_str = r#"
[site]
name = "Riverside Cancer Centre"
department = "Medical Physics"

[limits]
sigma_warning = 2.0
sigma_out_of_control = 3.0
min_baseline_count = 10
refresh_policy = "rolling"
refresh_every = 5
baseline_window = { records = 20 }

[trend]
trend_run_length = 7
same_side_run_length = 8

[kpi]
interval = "quarter"
goal_pct_in_control = 95.0
rolling_window = 3

[server]
addr = "127.0.0.1:8080"

[[tolerance]]
test_type = "output_6x"
low = 98.0
high = 102.0

[[tolerance]]
machine_id = "LA2"
test_type = "output_6x"
low = 97.0
high = 103.0
"#;
    assert!(validate_unknown_keys(toml_str).is_empty());
    let config = EngineConfig::from_toml_str(toml_str).unwrap();
    assert_eq!(config.kpi.interval, Interval::Quarter);
    assert_eq!(config.limits.refresh_policy, RefreshPolicy::Rolling);
}

#[test]
fn wildly_wrong_key_has_no_suggestion() {
    let warnings = validate_unknown_keys("[limits]\ncompletely_unrelated_setting = 1\n");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].suggestion.is_none());
}

#[test]
fn suggestion_respects_edit_distance() {
    let known = known_config_keys();
    assert_eq!(
        suggest_correction("trend.trend_run_lenght", &known).as_deref(),
        Some("trend.trend_run_length")
    );
    assert!(suggest_correction("kpi.something_else_entirely", &known).is_none());
}

// ============================================================================
// Range Validation
// ============================================================================

#[test]
fn defaults_have_no_range_errors() {
    let (errors, warnings) = validate_ranges(&EngineConfig::default());
    assert!(errors.is_empty());
    assert!(warnings.is_empty());
}

#[test]
fn narrow_warning_sigma_warns_but_validates() {
    let mut config = EngineConfig::default();
    config.limits.sigma_warning = 0.8;
    let (errors, warnings) = validate_ranges(&config);
    assert!(errors.is_empty());
    assert_eq!(warnings.len(), 1);
    assert!(config.validate().is_ok());
}

#[test]
fn bad_server_addr_is_an_error() {
    let mut config = EngineConfig::default();
    config.server.addr = "localhost".to_string();
    assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
}

#[test]
fn window_smaller_than_minimum_rejected() {
    let toml_str = r#"
[limits]
min_baseline_count = 25
baseline_window = { records = 20 }
"#;
    match EngineConfig::from_toml_str(toml_str) {
        Err(ConfigError::Validation(errors)) => {
            assert!(errors.iter().any(|e| e.contains("min_baseline_count")), "{errors:?}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn days_window_accepted() {
    let config = EngineConfig::from_toml_str("[limits]\nbaseline_window = { days = 90 }\n").unwrap();
    assert_eq!(config.limits.baseline_window, WindowSize::Days(90));
}

#[test]
fn malformed_toml_is_parse_error() {
    assert!(matches!(
        EngineConfig::from_toml_str("[limits\nsigma_warning = 2"),
        Err(ConfigError::Parse(..))
    ));
}

// ============================================================================
// File Round Trip
// ============================================================================

#[test]
fn save_and_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qa_kpi.toml");

    let mut config = EngineConfig::default();
    config.site.name = "Test Site".to_string();
    config.kpi.goal_pct_in_control = Some(90.0);
    config.save_to_file(&path).unwrap();

    let loaded = EngineConfig::load_from_file(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        EngineConfig::load_from_file(&dir.path().join("absent.toml")),
        Err(ConfigError::Io(..))
    ));
}

#[test]
fn tolerance_lookup_prefers_machine_rule() {
    let toml_str = r#"
[[tolerance]]
test_type = "output_6x"
low = 98.0
high = 102.0

[[tolerance]]
machine_id = "LA2"
test_type = "output_6x"
low = 97.0
high = 103.0
"#;
    let config = EngineConfig::from_toml_str(toml_str).unwrap();
    let la1 = config.tolerance_for(&GroupKey::new("LA1", "output_6x")).unwrap();
    let la2 = config.tolerance_for(&GroupKey::new("LA2", "output_6x")).unwrap();
    assert_eq!((la1.low, la1.high), (98.0, 102.0));
    assert_eq!((la2.low, la2.high), (97.0, 103.0));
    assert!(config.tolerance_for(&GroupKey::new("LA1", "mlc_position")).is_none());
}
