//! Measurement acquisition
//!
//! Reads QA exports from disk and normalizes them into canonical records.

pub mod normalizer;
pub mod source;

pub use normalizer::{normalize, parse_timestamp, parse_timestamp_str, RejectionSummary};
pub use source::{read_csv, read_json, read_json_lines, read_rows, InputFormat, SourceError};
