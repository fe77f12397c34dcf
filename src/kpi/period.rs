//! Reporting periods
//!
//! A period is a half-open `[start, end)` UTC interval aligned to its
//! interval: midnight, ISO Monday, first of month, first of quarter, or
//! January 1st. Consecutive periods tile the timeline without gaps.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Day,
    Week,
    #[default]
    Month,
    Quarter,
    Year,
}

impl Interval {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            "quarter" | "quarterly" => Ok(Self::Quarter),
            "year" | "yearly" | "annual" => Ok(Self::Year),
            other => Err(format!(
                "unknown interval '{other}' (expected day, week, month, quarter or year)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub interval: Interval,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// The period of `interval` that contains `ts`.
    ///
    /// At the edge of chrono's calendar the end saturates to the last
    /// representable date, so `end` never precedes `start`.
    pub fn containing(ts: DateTime<Utc>, interval: Interval) -> Self {
        let date = ts.date_naive();
        let start = match interval {
            Interval::Day => Some(date),
            Interval::Week => {
                date.checked_sub_signed(Duration::days(i64::from(date.weekday().num_days_from_monday())))
            }
            Interval::Month => first_of_month(date.year(), date.month0()),
            Interval::Quarter => first_of_month(date.year(), date.month0() / 3 * 3),
            Interval::Year => first_of_month(date.year(), 0),
        }
        .unwrap_or(NaiveDate::MIN);
        let end = match interval {
            Interval::Day => start.checked_add_signed(Duration::days(1)),
            Interval::Week => start.checked_add_signed(Duration::days(7)),
            Interval::Month => add_months(start, 1),
            Interval::Quarter => add_months(start, 3),
            Interval::Year => add_months(start, 12),
        }
        .unwrap_or(NaiveDate::MAX);
        Self {
            interval,
            start: midnight(start),
            end: midnight(end),
        }
    }

    /// The period immediately after this one.
    pub fn next(&self) -> Self {
        Self::containing(self.end, self.interval)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Whether `[from, to)` overlaps this period.
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start < to && from < self.end
    }

    /// Display label: `2025-01-15`, `2025-W03`, `Jan 2025`, `Q1 2025`, `2025`.
    pub fn label(&self) -> String {
        let d = self.start.date_naive();
        match self.interval {
            Interval::Day => d.format("%Y-%m-%d").to_string(),
            Interval::Week => {
                let w = d.iso_week();
                format!("{}-W{:02}", w.year(), w.week())
            }
            Interval::Month => d.format("%b %Y").to_string(),
            Interval::Quarter => format!("Q{} {}", d.month0() / 3 + 1, d.year()),
            Interval::Year => d.year().to_string(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Every period of `interval` overlapping `[from, to]`, in order.
pub fn periods_between(from: DateTime<Utc>, to: DateTime<Utc>, interval: Interval) -> Vec<Period> {
    let mut periods = Vec::new();
    if from > to {
        return periods;
    }
    let mut p = Period::containing(from, interval);
    while p.start <= to {
        periods.push(p);
        let next = p.next();
        // Saturated at the end of the calendar
        if next.start <= p.start {
            break;
        }
        p = next;
    }
    periods
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn first_of_month(year: i32, month0: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month0 + 1, 1)
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn add_months(first: NaiveDate, months: u32) -> Option<NaiveDate> {
    let total = first
        .year()
        .checked_mul(12)?
        .checked_add(first.month0() as i32 + months as i32)?;
    first_of_month(total.div_euclid(12), total.rem_euclid(12) as u32)
}
