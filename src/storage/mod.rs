//! Persistent store for limits, flags and period summaries (sled)
//!
//! Three trees, all keyed by a group prefix `machine\0test\0` so a group's
//! entries sort together and can be scanned with `scan_prefix`:
//!
//! - `limits`:    prefix + version (u32 BE)
//! - `flags`:     prefix + timestamp millis (sign-flipped i64 BE) + source row (u64 BE)
//! - `summaries`: prefix + interval tag + period start millis (sign-flipped i64 BE)
//!
//! Values are JSON. Limits are append-only: writing a version that already
//! exists is a no-op when identical and an error when it differs. A group's
//! flags and its summaries at the batch interval mirror the latest batch:
//! persisting a group replaces them in one sled batch per tree.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::baseline::{BaselineError, LimitsHistory};
use crate::kpi::{Interval, KpiSummary};
use crate::pipeline::{BatchReport, GroupReport};
use crate::types::{ControlLimits, FlagResult, GroupKey};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Limits version {version} for {group} already stored with different values")]
    LimitsConflict { group: GroupKey, version: u32 },
    #[error("Stored limits history is inconsistent: {0}")]
    History(#[from] BaselineError),
}

/// Counts from [`KpiStorage::persist`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistStats {
    pub limits_written: usize,
    pub limits_unchanged: usize,
    pub flags: usize,
    pub summaries: usize,
    /// Groups left untouched because their limits conflict with the store
    pub skipped: Vec<SkippedGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedGroup {
    pub key: GroupKey,
    pub error: String,
}

#[derive(Clone)]
pub struct KpiStorage {
    db: Arc<sled::Db>,
    limits: sled::Tree,
    flags: sled::Tree,
    summaries: sled::Tree,
}

impl KpiStorage {
    /// Open or create the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            limits: db.open_tree("limits")?,
            flags: db.open_tree("flags")?,
            summaries: db.open_tree("summaries")?,
            db: Arc::new(db),
        })
    }

    /// Store one limits version. Returns `false` when the identical version
    /// was already present.
    pub fn store_limits(&self, limits: &ControlLimits) -> Result<bool, StorageError> {
        let key = limits_key(&limits.group, limits.version);
        let value = serde_json::to_vec(limits)?;
        match self.limits.compare_and_swap(&key, None as Option<&[u8]>, Some(value.as_slice()))? {
            Ok(()) => Ok(true),
            Err(cas) if cas.current.as_deref() == Some(value.as_slice()) => Ok(false),
            Err(_) => Err(StorageError::LimitsConflict {
                group: limits.group.clone(),
                version: limits.version,
            }),
        }
    }

    /// All stored limits versions of `group`, oldest first.
    pub fn limits_history(&self, group: &GroupKey) -> Result<LimitsHistory, StorageError> {
        let mut history = LimitsHistory::new(group.clone());
        for item in self.limits.scan_prefix(group_prefix(group)) {
            let (_, value) = item?;
            history.push(serde_json::from_slice(&value)?)?;
        }
        Ok(history)
    }

    pub fn store_flag(&self, flag: &FlagResult) -> Result<(), StorageError> {
        let key = flag_key(&flag.record.group(), flag.record.timestamp, flag.record.source_row);
        self.flags.insert(key, serde_json::to_vec(flag)?)?;
        Ok(())
    }

    /// Flags of `group` timestamped within `[from, to)`.
    pub fn flags(
        &self,
        group: &GroupKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FlagResult>, StorageError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let start = flag_key(group, from, 0);
        let end = flag_key(group, to, 0);
        self.flags
            .range(start..end)
            .map(|item| {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    /// Store a summary, replacing any earlier one for the same period.
    pub fn store_summary(&self, summary: &KpiSummary) -> Result<(), StorageError> {
        let key = summary_key(&summary.group, summary.period.interval, summary.period.start);
        self.summaries.insert(key, serde_json::to_vec(summary)?)?;
        Ok(())
    }

    /// Stored summaries of `group` at `interval`, in period order.
    pub fn summaries(&self, group: &GroupKey, interval: Interval) -> Result<Vec<KpiSummary>, StorageError> {
        let mut prefix = group_prefix(group);
        prefix.push(interval_tag(interval));
        self.summaries
            .scan_prefix(prefix)
            .map(|item| {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    /// Write every group of a finished batch and flush.
    ///
    /// Groups are written independently. A group with a limits version that
    /// differs from the stored one is skipped whole and listed in
    /// [`PersistStats::skipped`]; the other groups are still written.
    /// Database and serialization errors abort the call.
    pub fn persist(&self, report: &BatchReport) -> Result<PersistStats, StorageError> {
        let mut stats = PersistStats::default();
        for group in &report.groups {
            match self.persist_group(group, &mut stats) {
                Ok(()) => debug!(group = %group.key, flags = group.flags.len(), "Group persisted"),
                Err(e @ StorageError::LimitsConflict { .. }) => {
                    warn!(group = %group.key, error = %e, "Group not persisted");
                    stats.skipped.push(SkippedGroup {
                        key: group.key.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        self.db.flush()?;
        info!(
            limits_written = stats.limits_written,
            limits_unchanged = stats.limits_unchanged,
            flags = stats.flags,
            summaries = stats.summaries,
            skipped = stats.skipped.len(),
            "Batch persisted"
        );
        Ok(stats)
    }

    /// Check every limits version before writing anything, then store the
    /// new versions and replace the group's flags and summaries.
    fn persist_group(&self, group: &GroupReport, stats: &mut PersistStats) -> Result<(), StorageError> {
        let mut fresh = Vec::new();
        let mut unchanged = 0;
        for limits in group.limits.iter() {
            let value = serde_json::to_vec(limits)?;
            match self.limits.get(limits_key(&limits.group, limits.version))? {
                Some(current) if &*current == value.as_slice() => unchanged += 1,
                Some(_) => {
                    return Err(StorageError::LimitsConflict {
                        group: limits.group.clone(),
                        version: limits.version,
                    })
                }
                None => fresh.push(limits),
            }
        }
        for limits in fresh {
            if self.store_limits(limits)? {
                stats.limits_written += 1;
            } else {
                stats.limits_unchanged += 1;
            }
        }
        stats.limits_unchanged += unchanged;

        let prefix = group_prefix(&group.key);
        let mut flags = sled::Batch::default();
        for key in self.flags.scan_prefix(&prefix).keys() {
            flags.remove(key?);
        }
        for flag in &group.flags {
            let key = flag_key(&group.key, flag.record.timestamp, flag.record.source_row);
            flags.insert(key, serde_json::to_vec(flag)?);
        }
        self.flags.apply_batch(flags)?;
        stats.flags += group.flags.len();

        let mut summary_prefix = prefix;
        summary_prefix.push(interval_tag(group.series.interval));
        let mut summaries = sled::Batch::default();
        for key in self.summaries.scan_prefix(&summary_prefix).keys() {
            summaries.remove(key?);
        }
        for summary in &group.series.summaries {
            let key = summary_key(&summary.group, summary.period.interval, summary.period.start);
            summaries.insert(key, serde_json::to_vec(summary)?);
        }
        self.summaries.apply_batch(summaries)?;
        stats.summaries += group.series.summaries.len();
        Ok(())
    }

    /// Get database size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

fn group_prefix(group: &GroupKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(group.machine_id.len() + group.test_type.len() + 2);
    key.extend_from_slice(group.machine_id.as_bytes());
    key.push(0);
    key.extend_from_slice(group.test_type.as_bytes());
    key.push(0);
    key
}

/// Millis with the sign bit flipped, so negative times sort before positive.
#[allow(clippy::cast_sign_loss)]
fn ordered_millis(ts: DateTime<Utc>) -> [u8; 8] {
    ((ts.timestamp_millis() as u64) ^ (1 << 63)).to_be_bytes()
}

const fn interval_tag(interval: Interval) -> u8 {
    match interval {
        Interval::Day => b'D',
        Interval::Week => b'W',
        Interval::Month => b'M',
        Interval::Quarter => b'Q',
        Interval::Year => b'Y',
    }
}

fn limits_key(group: &GroupKey, version: u32) -> Vec<u8> {
    let mut key = group_prefix(group);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn flag_key(group: &GroupKey, ts: DateTime<Utc>, source_row: usize) -> Vec<u8> {
    let mut key = group_prefix(group);
    key.extend_from_slice(&ordered_millis(ts));
    key.extend_from_slice(&(source_row as u64).to_be_bytes());
    key
}

fn summary_key(group: &GroupKey, interval: Interval, start: DateTime<Utc>) -> Vec<u8> {
    let mut key = group_prefix(group);
    key.push(interval_tag(interval));
    key.extend_from_slice(&ordered_millis(start));
    key
}
