//! File readers producing [`RawRow`]s
//!
//! CSV exports from the QA spreadsheet use varying column names, so headers
//! and JSON keys are matched case-insensitively against a list of aliases.
//!
//! Only unreadable files and broken top-level JSON are errors. A JSON row
//! that cannot be decoded becomes a [`RawRow::malformed`] placeholder and is
//! rejected by the normalizer like any other bad row.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{RawRow, RawValue};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is empty", .0.display())]
    Empty(PathBuf),
    #[error("{}: header has no {column} column (found: {found})", .path.display())]
    MissingColumn {
        path: PathBuf,
        column: &'static str,
        found: String,
    },
    #[error("{}: invalid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Cannot infer input format of {}; pass --format", .0.display())]
    UnknownFormat(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum InputFormat {
    Csv,
    Json,
    #[value(name = "jsonl")]
    JsonLines,
}

impl InputFormat {
    /// Infer from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "txt" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "jsonl" | "ndjson" => Some(Self::JsonLines),
            _ => None,
        }
    }
}

/// Read rows from `path`, inferring the format from the extension when not given.
pub fn read_rows(path: &Path, format: Option<InputFormat>) -> Result<Vec<RawRow>, SourceError> {
    let format = format
        .or_else(|| InputFormat::from_path(path))
        .ok_or_else(|| SourceError::UnknownFormat(path.to_path_buf()))?;
    let rows = match format {
        InputFormat::Csv => read_csv(path)?,
        InputFormat::Json => read_json(path)?,
        InputFormat::JsonLines => read_json_lines(path)?,
    };
    info!(file = %path.display(), format = ?format, rows = rows.len(), "Loaded input rows");
    Ok(rows)
}

fn read_text(path: &Path) -> Result<String, SourceError> {
    fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Canonical row fields that input columns and keys resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    MachineId,
    TestType,
    Timestamp,
    Value,
    Unit,
}

fn field_for(name: &str) -> Option<Field> {
    let name = name.trim().trim_start_matches('\u{feff}').to_lowercase();
    match name.as_str() {
        "machine_id" | "machine" | "machine id" | "linac" | "unit_id" => Some(Field::MachineId),
        "test_type" | "test" | "test type" | "test_name" | "check" => Some(Field::TestType),
        "timestamp" | "date" | "datetime" | "time" | "test_date" => Some(Field::Timestamp),
        "value" | "result" | "measurement" | "reading" => Some(Field::Value),
        "unit" | "units" => Some(Field::Unit),
        _ => None,
    }
}

// ============================================================================
// CSV
// ============================================================================

/// Column positions resolved from the header row.
#[derive(Debug, Default)]
struct ColumnMap {
    machine_id: Option<usize>,
    test_type: Option<usize>,
    timestamp: Option<usize>,
    value: Option<usize>,
    unit: Option<usize>,
}

impl ColumnMap {
    fn from_header(columns: &[String]) -> Self {
        let mut map = Self::default();
        for (idx, col) in columns.iter().enumerate() {
            let slot = match field_for(col) {
                Some(Field::MachineId) => &mut map.machine_id,
                Some(Field::TestType) => &mut map.test_type,
                Some(Field::Timestamp) => &mut map.timestamp,
                Some(Field::Value) => &mut map.value,
                Some(Field::Unit) => &mut map.unit,
                None => continue,
            };
            // First matching column wins
            if slot.is_none() {
                *slot = Some(idx);
            }
        }
        map
    }

    fn validate(&self, path: &Path, columns: &[String]) -> Result<(), SourceError> {
        let required = [
            (self.machine_id, "machine_id"),
            (self.test_type, "test_type"),
            (self.timestamp, "timestamp"),
            (self.value, "value"),
        ];
        for (slot, column) in required {
            if slot.is_none() {
                return Err(SourceError::MissingColumn {
                    path: path.to_path_buf(),
                    column,
                    found: columns.join(", "),
                });
            }
        }
        Ok(())
    }
}

/// Read a CSV file with a header row. Blank lines are skipped.
pub fn read_csv(path: &Path) -> Result<Vec<RawRow>, SourceError> {
    let text = read_text(path)?;
    parse_csv(path, &text)
}

fn parse_csv(path: &Path, text: &str) -> Result<Vec<RawRow>, SourceError> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or_else(|| SourceError::Empty(path.to_path_buf()))?;
    let columns = csv_split(header);
    let map = ColumnMap::from_header(&columns);
    map.validate(path, &columns)?;

    Ok(lines
        .map(|line| {
            let fields = csv_split(line);
            let cell = |idx: Option<usize>| {
                idx.and_then(|i| fields.get(i))
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            };
            RawRow {
                machine_id: cell(map.machine_id),
                test_type: cell(map.test_type),
                timestamp: cell(map.timestamp).map(RawValue::Text),
                value: cell(map.value).map(RawValue::Text),
                unit: cell(map.unit),
                malformed: None,
            }
        })
        .collect())
}

/// Split a CSV line on commas, honoring double-quoted fields and `""` escapes.
fn csv_split(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

// ============================================================================
// JSON
// ============================================================================

/// Read a JSON array of row objects.
pub fn read_json(path: &Path) -> Result<Vec<RawRow>, SourceError> {
    let text = read_text(path)?;
    let values: Vec<Value> = serde_json::from_str(&text).map_err(|source| SourceError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(values.iter().map(row_from_json).collect())
}

/// Read one JSON row object per line. Lines that are not valid JSON become
/// malformed rows.
pub fn read_json_lines(path: &Path) -> Result<Vec<RawRow>, SourceError> {
    let text = read_text(path)?;
    Ok(text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(idx, line)| match serde_json::from_str::<Value>(line) {
            Ok(value) => row_from_json(&value),
            Err(e) => {
                warn!(file = %path.display(), line = idx + 1, error = %e, "Undecodable JSON line");
                RawRow::malformed(format!("line {}: {e}", idx + 1))
            }
        })
        .collect())
}

/// Map a JSON value onto a row without trusting its field types.
///
/// Text fields take strings or numbers. Timestamp and value keep numbers
/// as numbers; any other JSON type is passed on as text so the normalizer
/// rejects it with a specific reason. Null counts as absent.
fn row_from_json(value: &Value) -> RawRow {
    let Some(object) = value.as_object() else {
        return RawRow::malformed(format!("expected a JSON object, found {value}"));
    };
    let mut row = RawRow::default();
    for (key, v) in object {
        if v.is_null() {
            continue;
        }
        match field_for(key) {
            Some(Field::MachineId) if row.machine_id.is_none() => row.machine_id = json_text(v),
            Some(Field::TestType) if row.test_type.is_none() => row.test_type = json_text(v),
            Some(Field::Timestamp) if row.timestamp.is_none() => row.timestamp = Some(json_cell(v)),
            Some(Field::Value) if row.value.is_none() => row.value = Some(json_cell(v)),
            Some(Field::Unit) if row.unit.is_none() => row.unit = json_text(v),
            _ => {}
        }
    }
    row
}

fn json_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_cell(v: &Value) -> RawValue {
    match v {
        Value::Number(n) => n.as_f64().map_or_else(|| RawValue::Text(n.to_string()), RawValue::Number),
        Value::String(s) => RawValue::Text(s.clone()),
        other => RawValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(suffix: &str, contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_csv_split_quoted() {
        let fields = csv_split(r#"LA1,"output, 6MV","say ""hi""",100"#);
        assert_eq!(fields, vec!["LA1", "output, 6MV", r#"say "hi""#, "100"]);
    }

    #[test]
    fn test_read_csv_with_aliases() {
        let file = temp_file(
            ".csv",
            "Machine,Test,Date,Result,Units\nLA1,output_6x,2025-01-15,100.2,%\n\nLA1,output_6x,2025-01-16,,%\n",
        );
        let rows = read_rows(file.path(), None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].machine_id.as_deref(), Some("LA1"));
        assert_eq!(rows[0].value, Some(RawValue::Text("100.2".to_string())));
        assert_eq!(rows[1].value, None);
    }

    #[test]
    fn test_read_csv_missing_column() {
        let file = temp_file(".csv", "machine,test,value\nLA1,output,1\n");
        let err = read_csv(file.path()).unwrap_err();
        assert!(matches!(err, SourceError::MissingColumn { column: "timestamp", .. }));
    }

    #[test]
    fn test_read_json_array() {
        let file = temp_file(
            ".json",
            r#"[{"machine_id":"LA1","test_type":"output_6x","timestamp":"2025-01-15","value":100.1,"unit":"%"}]"#,
        );
        let rows = read_rows(file.path(), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Some(RawValue::Number(100.1)));
    }

    #[test]
    fn test_read_json_lines() {
        let file = temp_file(
            ".jsonl",
            "{\"machine\":\"LA1\",\"test\":\"t\",\"date\":1736899200,\"value\":1}\n\n{\"machine\":\"LA2\"}\n",
        );
        let rows = read_json_lines(file.path()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].machine_id.as_deref(), Some("LA2"));
        assert!(rows[1].value.is_none());
    }

    #[test]
    fn test_bad_json_line_kept_as_malformed_row() {
        let file = temp_file(
            ".jsonl",
            concat!(
                "{\"machine_id\":\"LA1\",\"test_type\":\"t\",\"timestamp\":\"2025-01-01\",\"value\":1}\n",
                "{\"machine_id\":\"LA1\",\"test_type\":\n",
                "{\"machine_id\":\"LA1\",\"test_type\":\"t\",\"timestamp\":\"2025-01-03\",\"value\":3}\n",
            ),
        );
        let rows = read_json_lines(file.path()).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].malformed.is_none());
        assert!(rows[1].malformed.as_deref().unwrap().starts_with("line 2"));
        assert_eq!(rows[2].value, Some(RawValue::Number(3.0)));
    }

    #[test]
    fn test_json_field_types_are_lenient() {
        let file = temp_file(
            ".json",
            r#"[
                {"Machine":7,"Test":"t","Date":"2025-01-01","Result":"1.5","Units":null},
                {"machine_id":"LA1","test_type":"t","timestamp":"2025-01-02","value":{"v":1}},
                "not a row"
            ]"#,
        );
        let rows = read_json(file.path()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].machine_id.as_deref(), Some("7"));
        assert_eq!(rows[0].value, Some(RawValue::Text("1.5".to_string())));
        assert!(rows[0].unit.is_none());
        assert!(matches!(rows[1].value, Some(RawValue::Text(_))));
        assert!(rows[2].malformed.is_some());
    }

    #[test]
    fn test_broken_json_array_is_an_error() {
        let file = temp_file(".json", r#"[{"machine_id":"LA1"}"#);
        assert!(matches!(read_json(file.path()), Err(SourceError::Json { .. })));
    }

    #[test]
    fn test_unknown_extension_needs_format() {
        let file = temp_file(".dat", "machine,test,date,value\n");
        assert!(matches!(read_rows(file.path(), None), Err(SourceError::UnknownFormat(_))));
        assert!(read_rows(file.path(), Some(InputFormat::Csv)).unwrap().is_empty());
    }
}
