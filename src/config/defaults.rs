//! Engine-wide default constants.
//!
//! Every `#[serde(default = ...)]` in `engine_config.rs` resolves to one of
//! these, so a missing config file and an empty one behave identically.

// ============================================================================
// Control limits
// ============================================================================

/// Sigma multiplier for the warning zone.
pub const SIGMA_WARNING: f64 = 2.0;

/// Sigma multiplier for the out-of-control limits.
pub const SIGMA_OUT_OF_CONTROL: f64 = 3.0;

/// Records required in a baseline window before limits are valid.
pub const MIN_BASELINE_COUNT: usize = 10;

/// Baseline window length in records.
pub const BASELINE_WINDOW_RECORDS: usize = 20;

/// Rolling policy recomputes after this many new records.
pub const REFRESH_EVERY: usize = 5;

// ============================================================================
// Run rules
// ============================================================================

/// A monotonic run longer than this many points is a trend violation.
pub const TREND_RUN_LENGTH: usize = 7;

/// A same-side run longer than this many points is a trend violation.
pub const SAME_SIDE_RUN_LENGTH: usize = 8;

// ============================================================================
// KPI
// ============================================================================

/// Periods in the trailing rolling average of percentage in-control.
pub const ROLLING_WINDOW_PERIODS: usize = 3;

/// Minimum non-missing periods for a trendline.
pub const MIN_TREND_POINTS: usize = 3;

// ============================================================================
// Server
// ============================================================================

pub const SERVER_ADDR: &str = "0.0.0.0:8080";

/// Environment variable holding a config file path.
pub const CONFIG_ENV_VAR: &str = "QA_KPI_CONFIG";

/// Config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "qa_kpi.toml";
