//! Engine configuration - every SPC knob as an operator-tunable TOML value
//!
//! Each struct implements `Default` with the values from `defaults.rs`, so a
//! missing or partial file behaves the same as the built-in settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;
use crate::baseline::{LimitMethod, LimitSchedule, RefreshPolicy, WindowSize};
use crate::flagging::RunRules;
use crate::kpi::Interval;
use crate::types::{GroupKey, ToleranceBand};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one QA site.
///
/// Load with `EngineConfig::load()` which searches:
/// 1. `$QA_KPI_CONFIG` env var
/// 2. `./qa_kpi.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub site: SiteInfo,

    /// Control-limit computation and recomputation schedule
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Run rules
    #[serde(default)]
    pub trend: TrendConfig,

    /// Period aggregation
    #[serde(default)]
    pub kpi: KpiConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Clinical tolerance bands, machine-specific or per test type
    #[serde(default)]
    pub tolerance: Vec<ToleranceRule>,
}

impl EngineConfig {
    /// Load configuration using the standard search order.
    ///
    /// A file that exists but fails to parse or validate is an error: limits
    /// computed from a half-applied config would be silently wrong.
    pub fn load() -> Result<Self, ConfigError> {
        // 1. Check env var
        if let Ok(path) = std::env::var(defaults::CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                let config = Self::load_from_file(&p)?;
                info!(path = %p.display(), site = %config.site.name, "Loaded config from {}", defaults::CONFIG_ENV_VAR);
                return Ok(config);
            }
            warn!(path = %path, "{} points to non-existent file, falling back", defaults::CONFIG_ENV_VAR);
        }

        // 2. Check working directory
        let local = PathBuf::from(defaults::CONFIG_FILE_NAME);
        if local.exists() {
            let config = Self::load_from_file(&local)?;
            info!(site = %config.site.name, "Loaded config from ./{}", defaults::CONFIG_FILE_NAME);
            return Ok(config);
        }

        // 3. Defaults
        info!("No {} found, using built-in defaults", defaults::CONFIG_FILE_NAME);
        Ok(Self::default())
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        // Two-pass: unknown keys first (warnings only)
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::Parse(PathBuf::from("<inline>"), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        info!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Validate all settings for internal consistency.
    ///
    /// Rules:
    /// - `sigma_out_of_control` must exceed `sigma_warning`, both positive
    /// - counts and run lengths must be positive
    /// - a record-count baseline window must hold `min_baseline_count` records
    /// - tolerance bands must be finite with `low < high`
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (mut errors, warnings) = super::validation::validate_ranges(self);
        for w in &warnings {
            warn!("{}", w);
        }

        let l = &self.limits;
        if !(l.sigma_warning.is_finite() && l.sigma_warning > 0.0) {
            errors.push(format!("limits.sigma_warning = {} must be a positive number", l.sigma_warning));
        }
        Self::check_escalation(
            l.sigma_warning,
            l.sigma_out_of_control,
            "limits.sigma",
            &mut errors,
        );
        if l.min_baseline_count < 2 {
            errors.push(format!(
                "limits.min_baseline_count = {} must be at least 2 (sample variance needs two points)",
                l.min_baseline_count
            ));
        }
        match l.baseline_window {
            WindowSize::Records(n) if n < l.min_baseline_count => errors.push(format!(
                "limits.baseline_window.records = {n} is smaller than limits.min_baseline_count = {}; limits could never be established",
                l.min_baseline_count
            )),
            WindowSize::Days(0) => errors.push("limits.baseline_window.days must be > 0".to_string()),
            _ => {}
        }
        if l.refresh_every == 0 {
            errors.push("limits.refresh_every must be > 0".to_string());
        }

        let t = &self.trend;
        if t.trend_run_length < 2 {
            errors.push(format!("trend.trend_run_length = {} must be at least 2", t.trend_run_length));
        }
        if t.same_side_run_length < 2 {
            errors.push(format!("trend.same_side_run_length = {} must be at least 2", t.same_side_run_length));
        }

        let k = &self.kpi;
        if let Some(goal) = k.goal_pct_in_control {
            if !(0.0..=100.0).contains(&goal) {
                errors.push(format!("kpi.goal_pct_in_control = {goal} must be within [0, 100]"));
            }
        }
        if k.rolling_window == 0 {
            errors.push("kpi.rolling_window must be > 0".to_string());
        }
        if let (Some(start), Some(end)) = (k.report_start, k.report_end) {
            if start > end {
                errors.push(format!("kpi.report_start ({start}) is after kpi.report_end ({end})"));
            }
        }

        for (i, rule) in self.tolerance.iter().enumerate() {
            let label = format!("tolerance[{i}] ({})", rule.label());
            if rule.test_type.trim().is_empty() {
                errors.push(format!("{label}: test_type must not be empty"));
            }
            if !(rule.low.is_finite() && rule.high.is_finite()) {
                errors.push(format!("{label}: low/high must be finite"));
            } else if rule.low >= rule.high {
                errors.push(format!("{label}: low ({}) must be < high ({})", rule.low, rule.high));
            }
            let duplicate = self.tolerance[..i]
                .iter()
                .any(|r| r.machine_id == rule.machine_id && r.test_type == rule.test_type);
            if duplicate {
                errors.push(format!("{label}: duplicate tolerance entry"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_escalation(warning: f64, critical: f64, name: &str, errors: &mut Vec<String>) {
        if !critical.is_finite() || critical <= warning {
            errors.push(format!(
                "{name}: out_of_control ({critical}) must be greater than warning ({warning})"
            ));
        }
    }

    // ------------------------------------------------------------------------
    // Derived settings handed to the computation modules
    // ------------------------------------------------------------------------

    /// Tolerance band for a group; a machine-specific entry wins over a
    /// test-type wildcard.
    pub fn tolerance_for(&self, key: &GroupKey) -> Option<ToleranceBand> {
        let specific = self.tolerance.iter().find(|r| {
            r.test_type == key.test_type && r.machine_id.as_deref() == Some(key.machine_id.as_str())
        });
        let wildcard = || {
            self.tolerance
                .iter()
                .find(|r| r.test_type == key.test_type && r.machine_id.is_none())
        };
        specific
            .or_else(wildcard)
            .map(|r| ToleranceBand::new(r.low, r.high))
    }

    pub fn limit_method_for(&self, key: &GroupKey) -> LimitMethod {
        let method = LimitMethod::sigma(self.limits.sigma_warning, self.limits.sigma_out_of_control);
        match self.tolerance_for(key) {
            Some(band) => method.with_tolerance(band),
            None => method,
        }
    }

    pub const fn limit_schedule(&self) -> LimitSchedule {
        LimitSchedule {
            policy: self.limits.refresh_policy,
            window: self.limits.baseline_window,
            refresh_every: self.limits.refresh_every,
            min_baseline_count: self.limits.min_baseline_count,
        }
    }

    pub const fn run_rules(&self) -> RunRules {
        RunRules {
            trend_run_length: self.trend.trend_run_length,
            same_side_run_length: self.trend.same_side_run_length,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Site Info
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    #[serde(default = "default_site_name")]
    pub name: String,
    #[serde(default)]
    pub department: String,
}

impl Default for SiteInfo {
    fn default() -> Self {
        Self {
            name: default_site_name(),
            department: String::new(),
        }
    }
}

fn default_site_name() -> String {
    "DEFAULT".to_string()
}

// ============================================================================
// Limits
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_sigma_warning")]
    pub sigma_warning: f64,
    #[serde(default = "default_sigma_out_of_control")]
    pub sigma_out_of_control: f64,
    #[serde(default = "default_min_baseline_count")]
    pub min_baseline_count: usize,
    #[serde(default)]
    pub refresh_policy: RefreshPolicy,
    #[serde(default = "default_refresh_every")]
    pub refresh_every: usize,
    /// `{ records = N }` or `{ days = D }`. Kept last so it serializes after
    /// the plain values.
    #[serde(default)]
    pub baseline_window: WindowSize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            sigma_warning: default_sigma_warning(),
            sigma_out_of_control: default_sigma_out_of_control(),
            min_baseline_count: default_min_baseline_count(),
            refresh_policy: RefreshPolicy::default(),
            refresh_every: default_refresh_every(),
            baseline_window: WindowSize::default(),
        }
    }
}

const fn default_sigma_warning() -> f64 {
    defaults::SIGMA_WARNING
}
const fn default_sigma_out_of_control() -> f64 {
    defaults::SIGMA_OUT_OF_CONTROL
}
const fn default_min_baseline_count() -> usize {
    defaults::MIN_BASELINE_COUNT
}
const fn default_refresh_every() -> usize {
    defaults::REFRESH_EVERY
}

// ============================================================================
// Trend
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendConfig {
    #[serde(default = "default_trend_run_length")]
    pub trend_run_length: usize,
    #[serde(default = "default_same_side_run_length")]
    pub same_side_run_length: usize,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            trend_run_length: default_trend_run_length(),
            same_side_run_length: default_same_side_run_length(),
        }
    }
}

const fn default_trend_run_length() -> usize {
    defaults::TREND_RUN_LENGTH
}
const fn default_same_side_run_length() -> usize {
    defaults::SAME_SIDE_RUN_LENGTH
}

// ============================================================================
// KPI
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiConfig {
    #[serde(default)]
    pub interval: Interval,
    /// Target percentage of in-control results per period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_pct_in_control: Option<f64>,
    #[serde(default = "default_rolling_window")]
    pub rolling_window: usize,
    /// First day reported, as `"YYYY-MM-DD"`. Defaults to each group's first record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_start: Option<chrono::NaiveDate>,
    /// Last day reported. Defaults to each group's last record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_end: Option<chrono::NaiveDate>,
}

impl Default for KpiConfig {
    fn default() -> Self {
        Self {
            interval: Interval::default(),
            goal_pct_in_control: None,
            rolling_window: default_rolling_window(),
            report_start: None,
            report_end: None,
        }
    }
}

const fn default_rolling_window() -> usize {
    defaults::ROLLING_WINDOW_PERIODS
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

fn default_server_addr() -> String {
    defaults::SERVER_ADDR.to_string()
}

// ============================================================================
// Tolerance
// ============================================================================

/// `[[tolerance]]` entry. Without `machine_id` it applies to every machine
/// running `test_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    pub test_type: String,
    pub low: f64,
    pub high: f64,
}

impl ToleranceRule {
    fn label(&self) -> String {
        format!("{}:{}", self.machine_id.as_deref().unwrap_or("*"), self.test_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.baseline_window, WindowSize::Records(20));
        assert_eq!(config.kpi.interval, Interval::Month);
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
[limits]
sigma_warning = 1.5
baseline_window = { days = 90 }

[kpi]
interval = "quarter"
goal_pct_in_control = 95.0
"#,
        )
        .unwrap();
        assert!((config.limits.sigma_warning - 1.5).abs() < f64::EPSILON);
        assert!((config.limits.sigma_out_of_control - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.limits.baseline_window, WindowSize::Days(90));
        assert_eq!(config.kpi.interval, Interval::Quarter);
        assert_eq!(config.kpi.goal_pct_in_control, Some(95.0));
        assert_eq!(config.trend.trend_run_length, 7);
    }

    #[test]
    fn test_inverted_sigmas_rejected() {
        let mut config = EngineConfig::default();
        config.limits.sigma_warning = 3.0;
        config.limits.sigma_out_of_control = 2.0;
        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.contains("limits.sigma")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_window_smaller_than_min_count_rejected() {
        let mut config = EngineConfig::default();
        config.limits.baseline_window = WindowSize::Records(5);
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_inverted_tolerance_rejected() {
        let result = EngineConfig::from_toml_str(
            r#"
[[tolerance]]
test_type = "output_6x"
low = 103.0
high = 97.0
"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_machine_specific_tolerance_wins_over_wildcard() {
        let config = EngineConfig::from_toml_str(
            r#"
[[tolerance]]
test_type = "output_6x"
low = 97.0
high = 103.0

[[tolerance]]
machine_id = "LA2"
test_type = "output_6x"
low = 98.0
high = 102.0
"#,
        )
        .unwrap();

        let la1 = config.tolerance_for(&GroupKey::new("LA1", "output_6x")).unwrap();
        let la2 = config.tolerance_for(&GroupKey::new("LA2", "output_6x")).unwrap();
        assert!((la1.low - 97.0).abs() < f64::EPSILON);
        assert!((la2.low - 98.0).abs() < f64::EPSILON);
        assert!(config.tolerance_for(&GroupKey::new("LA1", "energy_ratio")).is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = EngineConfig::default();
        config.site.name = "North Campus".to_string();
        config.limits.baseline_window = WindowSize::Days(60);
        config.tolerance.push(ToleranceRule {
            machine_id: None,
            test_type: "output_6x".to_string(),
            low: 97.0,
            high: 103.0,
        });
        let text = config.to_toml().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_goal_out_of_range_rejected() {
        let mut config = EngineConfig::default();
        config.kpi.goal_pct_in_control = Some(120.0);
        assert!(config.validate().is_err());
    }
}
