//! Derived series over per-period KPI values: linear trendline and rolling mean

use serde::{Deserialize, Serialize};

use crate::config::defaults;

/// Extrapolation and clipping for [`linear_trend`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrendOptions {
    /// Periods to extrapolate before the first input period
    pub pred_before: usize,
    /// Periods to extrapolate after the last input period
    pub pred_after: usize,
    pub clip_min: Option<f64>,
    pub clip_max: Option<f64>,
}

impl TrendOptions {
    /// Percentages clip to `[0, 100]`.
    pub const fn percentage() -> Self {
        Self {
            pred_before: 0,
            pred_after: 0,
            clip_min: Some(0.0),
            clip_max: Some(100.0),
        }
    }
}

/// Least-squares line `y = slope·x + intercept` with `intercept ≥ 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendLine {
    pub slope: f64,
    pub intercept: f64,
    /// Non-missing points the line was fitted to
    pub points: usize,
    /// Fitted values for x = −pred_before .. n + pred_after
    pub values: Vec<f64>,
}

/// Fit a trendline to `y`, where x is the period index and `None` marks a
/// period with no value. Needs at least three values.
///
/// When the unconstrained intercept is negative the line is refit through
/// the origin.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
pub fn linear_trend(y: &[Option<f64>], opts: &TrendOptions) -> Option<TrendLine> {
    let points: Vec<(f64, f64)> = y
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.filter(|v| v.is_finite()).map(|v| (i as f64, v)))
        .collect();
    if points.len() < defaults::MIN_TREND_POINTS {
        return None;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();

    let (mut slope, mut intercept) = if sxx > 0.0 {
        let slope = sxy / sxx;
        (slope, mean_y - slope * mean_x)
    } else {
        (0.0, mean_y)
    };
    if intercept < 0.0 {
        let sum_xx: f64 = points.iter().map(|p| p.0 * p.0).sum();
        let sum_xy: f64 = points.iter().map(|p| p.0 * p.1).sum();
        slope = if sum_xx > 0.0 { sum_xy / sum_xx } else { 0.0 };
        intercept = 0.0;
    }

    let first = -(opts.pred_before as i64);
    let last = (y.len() + opts.pred_after) as i64;
    let values = (first..last)
        .map(|x| {
            let v = slope * x as f64 + intercept;
            let v = opts.clip_min.map_or(v, |lo| v.max(lo));
            opts.clip_max.map_or(v, |hi| v.min(hi))
        })
        .collect();

    Some(TrendLine {
        slope,
        intercept,
        points: points.len(),
        values,
    })
}

/// Trailing mean over `window` periods. A value exists only when every
/// period in the window has one.
#[allow(clippy::cast_precision_loss)]
pub fn rolling_average(y: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; y.len()];
    }
    (0..y.len())
        .map(|i| {
            if i + 1 < window {
                return None;
            }
            let slice = &y[i + 1 - window..=i];
            let sum: Option<f64> = slice.iter().copied().sum();
            sum.map(|s| s / window as f64)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_line_recovered() {
        let y: Vec<Option<f64>> = (0..5).map(|x| Some(2.0 * f64::from(x) + 1.0)).collect();
        let t = linear_trend(&y, &TrendOptions::default()).unwrap();
        assert!((t.slope - 2.0).abs() < 1e-12);
        assert!((t.intercept - 1.0).abs() < 1e-12);
        assert_eq!(t.values.len(), 5);
        assert!((t.values[4] - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_negative_intercept_refits_through_origin() {
        // Unconstrained fit: y = 2x - 3
        let y = vec![Some(-3.0), Some(-1.0), Some(1.0), Some(3.0)];
        let t = linear_trend(&y, &TrendOptions::default()).unwrap();
        assert_eq!(t.intercept, 0.0);
        // Σxy / Σx² = (0 - 1 + 2 + 9) / (0 + 1 + 4 + 9)
        assert!((t.slope - 10.0 / 14.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_points_skipped_and_too_few_rejected() {
        let y = vec![Some(90.0), None, Some(95.0)];
        assert!(linear_trend(&y, &TrendOptions::default()).is_none());

        let y = vec![Some(90.0), None, Some(94.0), Some(96.0)];
        let t = linear_trend(&y, &TrendOptions::default()).unwrap();
        assert_eq!(t.points, 3);
        assert_eq!(t.values.len(), 4);
    }

    #[test]
    fn test_extrapolation_and_clipping() {
        let y = vec![Some(90.0), Some(95.0), Some(100.0)];
        let opts = TrendOptions {
            pred_before: 1,
            pred_after: 2,
            ..TrendOptions::percentage()
        };
        let t = linear_trend(&y, &opts).unwrap();
        assert_eq!(t.values.len(), 6);
        assert!((t.values[0] - 85.0).abs() < 1e-9);
        assert_eq!(t.values[5], 100.0);
    }

    #[test]
    fn test_rolling_average_needs_full_window() {
        let y = vec![Some(90.0), Some(93.0), Some(96.0), None, Some(99.0), Some(99.0), Some(96.0)];
        let r = rolling_average(&y, 3);
        assert_eq!(r[0], None);
        assert_eq!(r[1], None);
        assert_eq!(r[2], Some(93.0));
        assert_eq!(r[3], None);
        assert_eq!(r[5], None);
        assert_eq!(r[6], Some(98.0));
    }
}
