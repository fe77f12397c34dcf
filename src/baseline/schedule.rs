//! Baseline windows and the limit recomputation schedule

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{compute_limits, BaselineError, LimitMethod, LimitsHistory, LimitsOutcome};
use crate::config::defaults;
use crate::types::{ControlLimits, GroupKey, MeasurementRecord, SourceWindow};

/// Size of a baseline window: a record count or a span of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSize {
    Records(usize),
    Days(u32),
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::Records(defaults::BASELINE_WINDOW_RECORDS)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Recompute from the trailing window every `refresh_every` records
    #[default]
    Rolling,
    /// Compute once from the group's first window
    Fixed,
}

/// An ordered slice of one group's records used to compute limits.
#[derive(Debug, Clone, Copy)]
pub struct BaselineWindow<'a> {
    records: &'a [MeasurementRecord],
}

impl<'a> BaselineWindow<'a> {
    pub const fn new(records: &'a [MeasurementRecord]) -> Self {
        Self { records }
    }

    /// The most recent window of `preceding` before `at`.
    pub fn trailing(preceding: &'a [MeasurementRecord], size: WindowSize, at: DateTime<Utc>) -> Self {
        let records = match size {
            WindowSize::Records(n) => &preceding[preceding.len().saturating_sub(n)..],
            WindowSize::Days(d) => {
                let start = at
                    .checked_sub_signed(Duration::days(i64::from(d)))
                    .map_or(0, |cutoff| preceding.partition_point(|r| r.timestamp < cutoff));
                &preceding[start..]
            }
        };
        Self { records }
    }

    /// The first window of a group's records.
    pub fn leading(records: &'a [MeasurementRecord], size: WindowSize) -> Self {
        let end = match size {
            WindowSize::Records(n) => n.min(records.len()),
            WindowSize::Days(d) => match leading_cutoff(records, d) {
                Some(cutoff) => records.partition_point(|r| r.timestamp < cutoff),
                None => records.len(),
            },
        };
        Self {
            records: &records[..end],
        }
    }

    pub const fn records(&self) -> &'a [MeasurementRecord] {
        self.records
    }

    pub const fn len(&self) -> usize {
        self.records.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn span(&self) -> Option<SourceWindow> {
        let first = self.records.first()?;
        let last = self.records.last()?;
        Some(SourceWindow {
            first: first.timestamp,
            last: last.timestamp,
            count: self.records.len(),
        })
    }
}

/// End (exclusive) of a day-based leading window.
fn leading_cutoff(records: &[MeasurementRecord], days: u32) -> Option<DateTime<Utc>> {
    records
        .first()?
        .timestamp
        .checked_add_signed(Duration::days(i64::from(days)))
}

/// When and from which window limits are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSchedule {
    pub policy: RefreshPolicy,
    pub window: WindowSize,
    pub refresh_every: usize,
    pub min_baseline_count: usize,
}

impl Default for LimitSchedule {
    fn default() -> Self {
        Self {
            policy: RefreshPolicy::default(),
            window: WindowSize::default(),
            refresh_every: defaults::REFRESH_EVERY,
            min_baseline_count: defaults::MIN_BASELINE_COUNT,
        }
    }
}

/// Walks one group's records in order and keeps its limits current.
///
/// Limits used for record `i` are computed only from records before `i`, so
/// the version a flag reports always predates the record it judged.
#[derive(Debug)]
pub struct LimitTracker {
    schedule: LimitSchedule,
    method: LimitMethod,
    history: LimitsHistory,
    /// Preceding-record count at the last computation attempt
    last_refresh: Option<usize>,
    fixed_settled: bool,
}

impl LimitTracker {
    pub fn new(group: GroupKey, schedule: LimitSchedule, method: LimitMethod) -> Self {
        let method = method.with_min_baseline_count(schedule.min_baseline_count);
        Self {
            schedule,
            method,
            history: LimitsHistory::new(group),
            last_refresh: None,
            fixed_settled: false,
        }
    }

    /// Recompute limits if due before evaluating `records[index]`, then
    /// return the limits in force for it.
    pub fn advance(
        &mut self,
        records: &[MeasurementRecord],
        index: usize,
    ) -> Result<Option<&ControlLimits>, BaselineError> {
        let preceding = &records[..index.min(records.len())];
        let Some(current) = records.get(index) else {
            return Ok(self.history.latest());
        };

        if let Some(window) = self.due_window(preceding, current.timestamp) {
            self.last_refresh = Some(preceding.len());
            let version = self.history.next_version();
            match compute_limits(self.history.group(), &window, &self.method, version)? {
                LimitsOutcome::Established(limits) => {
                    info!(
                        group = %self.history.group(),
                        version,
                        center = limits.center,
                        std_dev = limits.std_dev,
                        samples = limits.sample_count,
                        "Control limits computed"
                    );
                    self.history.push(limits)?;
                }
                LimitsOutcome::Unestablished { have, need } => {
                    if self.schedule.policy == RefreshPolicy::Fixed {
                        warn!(
                            group = %self.history.group(),
                            have,
                            need,
                            "Fixed baseline window too small, group stays unestablished"
                        );
                    } else {
                        debug!(group = %self.history.group(), have, need, "Baseline window too small");
                    }
                }
            }
        }

        Ok(self.history.latest())
    }

    fn due_window<'a>(
        &mut self,
        preceding: &'a [MeasurementRecord],
        at: DateTime<Utc>,
    ) -> Option<BaselineWindow<'a>> {
        let s = self.schedule;
        match s.policy {
            RefreshPolicy::Rolling => {
                let due = if self.history.is_empty() {
                    preceding.len() >= s.min_baseline_count
                } else {
                    let since = preceding.len().saturating_sub(self.last_refresh.unwrap_or(0));
                    since >= s.refresh_every
                };
                due.then(|| BaselineWindow::trailing(preceding, s.window, at))
            }
            RefreshPolicy::Fixed => {
                if self.fixed_settled || preceding.is_empty() {
                    return None;
                }
                let complete = match s.window {
                    WindowSize::Records(n) => preceding.len() >= n,
                    WindowSize::Days(d) => leading_cutoff(preceding, d).is_some_and(|cutoff| at >= cutoff),
                };
                if !complete {
                    return None;
                }
                self.fixed_settled = true;
                Some(BaselineWindow::leading(preceding, s.window))
            }
        }
    }

    pub const fn history(&self) -> &LimitsHistory {
        &self.history
    }

    pub fn into_history(self) -> LimitsHistory {
        self.history
    }
}
