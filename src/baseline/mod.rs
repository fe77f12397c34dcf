//! Baseline & Control Limits Module
//!
//! Learns each group's centre and spread from a baseline window and turns them
//! into sigma-banded control limits.
//!
//! ## Architecture
//!
//! - `BaselineAccumulator`: Welford online mean/variance over a window
//! - `LimitMethod`: sigma multipliers, minimum window size, optional tolerance band
//! - `compute_limits`: window → `LimitsOutcome`
//! - `LimitsHistory`: append-only versioned limits per group
//! - `LimitTracker` (in `schedule`): decides when limits are (re)computed
//!
//! ## Usage
//!
//! ```ignore
//! let window = BaselineWindow::new(&records[..20]);
//! let method = LimitMethod::sigma(2.0, 3.0);
//! match compute_limits(&key, &window, &method, 1)? {
//!     LimitsOutcome::Established(limits) => history.push(limits)?,
//!     LimitsOutcome::Unestablished { have, need } => { /* keep waiting */ }
//! }
//! ```

mod schedule;

pub use schedule::{BaselineWindow, LimitSchedule, LimitTracker, RefreshPolicy, WindowSize};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::defaults;
use crate::types::{ControlLimits, GroupKey, ToleranceBand};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum BaselineError {
    #[error("Non-finite {statistic} while computing limits for {group}")]
    NonFinite { group: GroupKey, statistic: &'static str },

    #[error("Invalid limit method: {0}")]
    InvalidMethod(String),

    #[error("Limits for {group} must be version {expected}, got {got}")]
    VersionOutOfOrder { group: GroupKey, expected: u32, got: u32 },

    #[error("Limits for {got} pushed into history of {expected}")]
    GroupMismatch { expected: GroupKey, got: GroupKey },
}

// ============================================================================
// Welford Accumulator
// ============================================================================

/// Running mean and variance.
///
/// Uses Welford's online algorithm for numerically stable mean/variance calculation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineAccumulator {
    pub count: usize,
    pub mean: f64,
    /// Sum of squared deviations from the running mean
    pub m2: f64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl BaselineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn add_sample(&mut self, value: f64) {
        self.count += 1;
        self.min_value = Some(self.min_value.map_or(value, |m| m.min(value)));
        self.max_value = Some(self.max_value.map_or(value, |m| m.max(value)));

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    /// Sample variance (n − 1 denominator); zero below two samples.
    #[allow(clippy::cast_precision_loss)]
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

// ============================================================================
// Limit Method
// ============================================================================

/// How limits are derived from a baseline window: mean ± k·σ.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitMethod {
    pub sigma_warning: f64,
    pub sigma_out_of_control: f64,
    /// Window records required before limits are valid
    pub min_baseline_count: usize,
    /// Clinical band checked ahead of the statistical limits
    pub tolerance: Option<ToleranceBand>,
}

impl Default for LimitMethod {
    fn default() -> Self {
        Self::sigma(defaults::SIGMA_WARNING, defaults::SIGMA_OUT_OF_CONTROL)
    }
}

impl LimitMethod {
    pub const fn sigma(sigma_warning: f64, sigma_out_of_control: f64) -> Self {
        Self {
            sigma_warning,
            sigma_out_of_control,
            min_baseline_count: defaults::MIN_BASELINE_COUNT,
            tolerance: None,
        }
    }

    #[must_use]
    pub fn with_min_baseline_count(mut self, count: usize) -> Self {
        self.min_baseline_count = count;
        self
    }

    #[must_use]
    pub fn with_tolerance(mut self, band: ToleranceBand) -> Self {
        self.tolerance = Some(band);
        self
    }

    fn validate(&self) -> Result<(), BaselineError> {
        if !(self.sigma_warning.is_finite() && self.sigma_warning > 0.0) {
            return Err(BaselineError::InvalidMethod(format!(
                "sigma_warning {} must be positive",
                self.sigma_warning
            )));
        }
        if !(self.sigma_out_of_control.is_finite() && self.sigma_out_of_control > self.sigma_warning) {
            return Err(BaselineError::InvalidMethod(format!(
                "sigma_out_of_control {} must exceed sigma_warning {}",
                self.sigma_out_of_control, self.sigma_warning
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Limit Computation
// ============================================================================

/// Result of a limit computation. Too small a window is a normal state, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitsOutcome {
    Established(ControlLimits),
    Unestablished { have: usize, need: usize },
}

impl LimitsOutcome {
    pub const fn limits(&self) -> Option<&ControlLimits> {
        match self {
            Self::Established(limits) => Some(limits),
            Self::Unestablished { .. } => None,
        }
    }
}

/// Compute control limits for `group` from `window`, stamped with `version`.
///
/// Deterministic: the same window and method always give the same limits,
/// including `computed_at`, which is the last window record's timestamp.
pub fn compute_limits(
    group: &GroupKey,
    window: &BaselineWindow<'_>,
    method: &LimitMethod,
    version: u32,
) -> Result<LimitsOutcome, BaselineError> {
    method.validate()?;

    let need = method.min_baseline_count.max(1);
    let span = match window.span() {
        Some(span) if window.len() >= need => span,
        _ => {
            return Ok(LimitsOutcome::Unestablished {
                have: window.len(),
                need,
            })
        }
    };

    let mut acc = BaselineAccumulator::new();
    for record in window.records() {
        acc.add_sample(record.value);
    }

    let center = acc.mean;
    let std_dev = acc.std_dev();
    let non_finite = |statistic: &'static str| BaselineError::NonFinite {
        group: group.clone(),
        statistic,
    };
    if !center.is_finite() {
        return Err(non_finite("mean"));
    }
    if !std_dev.is_finite() {
        return Err(non_finite("std_dev"));
    }

    let limits = ControlLimits {
        group: group.clone(),
        version,
        center,
        std_dev,
        upper_limit: center + method.sigma_out_of_control * std_dev,
        lower_limit: center - method.sigma_out_of_control * std_dev,
        upper_warning: center + method.sigma_warning * std_dev,
        lower_warning: center - method.sigma_warning * std_dev,
        tolerance_band: method.tolerance,
        sample_count: acc.count,
        computed_at: span.last,
        source_window: span,
    };
    if !(limits.upper_limit.is_finite() && limits.lower_limit.is_finite()) {
        return Err(non_finite("control limit"));
    }

    Ok(LimitsOutcome::Established(limits))
}

// ============================================================================
// Limits History
// ============================================================================

/// Append-only log of a group's limit versions, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsHistory {
    group: GroupKey,
    versions: Vec<ControlLimits>,
}

impl LimitsHistory {
    pub const fn new(group: GroupKey) -> Self {
        Self {
            group,
            versions: Vec::new(),
        }
    }

    pub const fn group(&self) -> &GroupKey {
        &self.group
    }

    /// Version the next pushed limits must carry.
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_version(&self) -> u32 {
        self.versions.len() as u32 + 1
    }

    /// Append a new version. Anything other than `latest + 1` is rejected.
    pub fn push(&mut self, limits: ControlLimits) -> Result<&ControlLimits, BaselineError> {
        if limits.group != self.group {
            return Err(BaselineError::GroupMismatch {
                expected: self.group.clone(),
                got: limits.group,
            });
        }
        let expected = self.next_version();
        if limits.version != expected {
            return Err(BaselineError::VersionOutOfOrder {
                group: self.group.clone(),
                expected,
                got: limits.version,
            });
        }
        self.versions.push(limits);
        Ok(&self.versions[self.versions.len() - 1])
    }

    pub fn latest(&self) -> Option<&ControlLimits> {
        self.versions.last()
    }

    pub fn version(&self, version: u32) -> Option<&ControlLimits> {
        let idx = usize::try_from(version).ok()?.checked_sub(1)?;
        self.versions.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControlLimits> {
        self.versions.iter()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
