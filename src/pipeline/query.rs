//! Pull-based read access to a finished batch
//!
//! Time filters are half-open `[from, to)`; `None` leaves that side open.

use chrono::{DateTime, Utc};

use super::{report_range, series_options, BatchReport, GroupReport};
use crate::baseline::LimitsHistory;
use crate::config::KpiConfig;
use crate::kpi::{build_series, Interval, KpiSeries, KpiSummary, SeriesOptions};
use crate::types::{FlagResult, GroupKey};

fn bounds(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        from.unwrap_or(DateTime::<Utc>::MIN_UTC),
        to.unwrap_or(DateTime::<Utc>::MAX_UTC),
    )
}

impl BatchReport {
    pub fn group(&self, key: &GroupKey) -> Option<&GroupReport> {
        self.groups
            .binary_search_by(|g| g.key.cmp(key))
            .ok()
            .map(|idx| &self.groups[idx])
    }

    /// Summaries whose period overlaps `[from, to)`.
    pub fn summaries(
        &self,
        key: &GroupKey,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Option<Vec<&KpiSummary>> {
        let (from, to) = bounds(from, to);
        let group = self.group(key)?;
        Some(
            group
                .series
                .summaries
                .iter()
                .filter(|s| s.period.overlaps(from, to))
                .collect(),
        )
    }

    /// Flags of records timestamped within `[from, to)`.
    pub fn flags(
        &self,
        key: &GroupKey,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Option<Vec<&FlagResult>> {
        let (from, to) = bounds(from, to);
        let group = self.group(key)?;
        Some(
            group
                .flags
                .iter()
                .filter(|f| from <= f.record.timestamp && f.record.timestamp < to)
                .collect(),
        )
    }

    pub fn limits(&self, key: &GroupKey) -> Option<&LimitsHistory> {
        self.group(key).map(|g| &g.limits)
    }

    /// Groups still waiting for enough baseline data.
    pub fn unestablished_groups(&self) -> Vec<&GroupKey> {
        self.groups
            .iter()
            .filter(|g| !g.is_established())
            .map(|g| &g.key)
            .collect()
    }

    /// Rebuild a group's series at another interval from its flags, over
    /// the same reporting range the batch used.
    pub fn series_at(&self, key: &GroupKey, interval: Interval, kpi: &KpiConfig) -> Option<KpiSeries> {
        let group = self.group(key)?;
        if interval == group.series.interval {
            return Some(group.series.clone());
        }
        let (from, to) = report_range(
            group.flags.first()?.record.timestamp,
            group.flags.last()?.record.timestamp,
            kpi,
        );
        let opts = SeriesOptions {
            interval,
            ..series_options(kpi)
        };
        Some(build_series(key, from, to, &group.flags, &opts))
    }
}
