//! QA KPI: machine QA control limits, trend flagging and period KPIs
//!
//! Turns raw QA measurements into statistical process control results.
//!
//! ## Architecture
//!
//! - **Acquisition**: normalize raw rows into canonical records, reject the rest
//! - **Baseline**: versioned mean ± kσ control limits per (machine, test) group
//! - **Flagging**: tolerance band, control limit, warning zone and run rules
//! - **KPI**: per-period summaries, trendline and rolling average
//! - **Pipeline**: parallel per-group batch run with a pull-based query surface

pub mod acquisition;
pub mod api;
pub mod baseline;
pub mod config;
pub mod flagging;
pub mod kpi;
pub mod pipeline;
pub mod storage;
pub mod types;

pub use config::{ConfigError, EngineConfig};

pub use types::{
    ControlLimits, FlagResult, FlagStatus, GroupKey, MeasurementRecord, RawRow, RawValue,
    RejectReason, RejectedRow, SpcRule, ToleranceBand,
};

pub use baseline::{
    compute_limits, BaselineError, BaselineWindow, LimitMethod, LimitSchedule, LimitTracker,
    LimitsHistory, LimitsOutcome, RefreshPolicy, WindowSize,
};

pub use flagging::{evaluate, RunRules};

pub use kpi::{aggregate, build_series, summarize, Interval, KpiSeries, KpiSummary, Period, StatusCounts};

pub use pipeline::{run, BatchReport, GroupFailure, GroupReport};

pub use storage::{KpiStorage, PersistStats, StorageError};
