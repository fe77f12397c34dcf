//! Config validation: unknown-key detection with Levenshtein suggestions
//! and range checks.
//!
//! Two-pass parse approach: first deserialize raw TOML into `toml::Value`,
//! walk the key tree, compare against known field names, and emit warnings
//! with "did you mean?" suggestions. Then proceed with normal serde
//! deserialization. Warnings never break existing configs.

use std::collections::HashSet;

use super::EngineConfig;
use crate::baseline::WindowSize;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Returns the complete set of valid dotted key paths for `EngineConfig`.
///
/// Maintained by hand to match the struct hierarchy in `engine_config.rs`.
/// Entries of the `[[tolerance]]` array are walked under the `tolerance` prefix.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [site]
        "site",
        "site.name",
        "site.department",
        // [limits]
        "limits",
        "limits.sigma_warning",
        "limits.sigma_out_of_control",
        "limits.min_baseline_count",
        "limits.refresh_policy",
        "limits.refresh_every",
        "limits.baseline_window",
        "limits.baseline_window.records",
        "limits.baseline_window.days",
        // [trend]
        "trend",
        "trend.trend_run_length",
        "trend.same_side_run_length",
        // [kpi]
        "kpi",
        "kpi.interval",
        "kpi.goal_pct_in_control",
        "kpi.rolling_window",
        "kpi.report_start",
        "kpi.report_end",
        // [server]
        "server",
        "server.addr",
        // [[tolerance]]
        "tolerance",
        "tolerance.machine_id",
        "tolerance.test_type",
        "tolerance.low",
        "tolerance.high",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// Tables inside arrays share their parent's prefix, so
/// `[[tolerance]] low = 1` yields `["tolerance", "tolerance.low"]`.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            match v {
                toml::Value::Table(_) => keys.extend(walk_toml_keys(v, &path)),
                toml::Value::Array(items) => {
                    for item in items.iter().filter(|i| i.is_table()) {
                        for nested in walk_toml_keys(item, &path) {
                            if !keys.contains(&nested) {
                                keys.push(nested);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let b_len = b_chars.len();
    if a.is_empty() {
        return b_len;
    }
    if b_len == 0 {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;
    for &k in known {
        let dist = levenshtein(unknown, k);
        if dist > 3 {
            continue;
        }
        // Ties resolve alphabetically so suggestions do not depend on hash order
        let better = match best {
            None => true,
            Some((best_key, best_dist)) => dist < best_dist || (dist == best_dist && k < best_key),
        };
        if better {
            best = Some((k, dist));
        }
    }
    best.map(|(k, _)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// Does not fail on unknown keys; parse errors are reported by serde later.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| {
            let suggestion = suggest_correction(&key, &known);
            ValidationWarning {
                message: format!("Unknown config key '{key}'"),
                field: key,
                suggestion,
            }
        })
        .collect()
}

// ============================================================================
// Range Validation
// ============================================================================

/// Range checks on a parsed `EngineConfig`.
///
/// Returns (errors, warnings): errors are impossible values that must prevent
/// processing; warnings are legal but unusual for QA control charts.
pub fn validate_ranges(config: &EngineConfig) -> (Vec<String>, Vec<ValidationWarning>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let l = &config.limits;

    if l.sigma_warning.is_finite() && l.sigma_warning < 1.0 {
        warnings.push(ValidationWarning {
            field: "limits.sigma_warning".to_string(),
            message: format!(
                "limits.sigma_warning = {:.2} will put roughly a third of nominal results in the warning zone",
                l.sigma_warning
            ),
            suggestion: None,
        });
    }
    if l.sigma_out_of_control.is_finite() && l.sigma_out_of_control > 6.0 {
        warnings.push(ValidationWarning {
            field: "limits.sigma_out_of_control".to_string(),
            message: format!(
                "limits.sigma_out_of_control = {:.2} is unusually wide; out-of-control results will be rare",
                l.sigma_out_of_control
            ),
            suggestion: None,
        });
    }
    if (2..5).contains(&l.min_baseline_count) {
        warnings.push(ValidationWarning {
            field: "limits.min_baseline_count".to_string(),
            message: format!(
                "limits.min_baseline_count = {} gives a very noisy standard deviation estimate",
                l.min_baseline_count
            ),
            suggestion: None,
        });
    }
    if let WindowSize::Days(d) = l.baseline_window {
        if d > 3_650 {
            errors.push(format!("limits.baseline_window.days = {d} exceeds ten years"));
        }
    }
    if config.trend.same_side_run_length < config.trend.trend_run_length {
        warnings.push(ValidationWarning {
            field: "trend.same_side_run_length".to_string(),
            message: format!(
                "trend.same_side_run_length ({}) is shorter than trend.trend_run_length ({}); the same-side rule will always fire first",
                config.trend.same_side_run_length, config.trend.trend_run_length
            ),
            suggestion: None,
        });
    }
    if config.server.addr.parse::<std::net::SocketAddr>().is_err() {
        errors.push(format!("server.addr = '{}' is not a socket address", config.server.addr));
    }

    (errors, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_identical() {
        assert_eq!(levenshtein("sigma", "sigma"), 0);
    }

    #[test]
    fn test_levenshtein_one_edit() {
        assert_eq!(levenshtein("sigma_warnng", "sigma_warning"), 1);
    }

    #[test]
    fn test_levenshtein_empty() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn test_walk_toml_keys_nested() {
        let toml: toml::Value = r#"
            [limits]
            sigma_warning = 2.0
            baseline_window = { records = 30 }
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert!(keys.contains(&"limits".to_string()));
        assert!(keys.contains(&"limits.sigma_warning".to_string()));
        assert!(keys.contains(&"limits.baseline_window.records".to_string()));
    }

    #[test]
    fn test_walk_toml_keys_array_of_tables() {
        let toml: toml::Value = r#"
            [[tolerance]]
            test_type = "output_6x"
            low = 97.0
            high = 103.0

            [[tolerance]]
            test_type = "output_10x"
            low = 97.0
            high = 103.0
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert_eq!(
            keys,
            vec!["tolerance", "tolerance.high", "tolerance.low", "tolerance.test_type"]
        );
    }

    #[test]
    fn test_typo_key_produces_warning_with_suggestion() {
        let toml_str = r#"
[limits]
sigma_warnng = 2.5
"#;
        let warnings = validate_unknown_keys(toml_str);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "limits.sigma_warnng");
        assert_eq!(warnings[0].suggestion.as_deref(), Some("limits.sigma_warning"));
    }

    #[test]
    fn test_all_valid_keys_produce_zero_warnings() {
        let toml_str = r#"
[site]
name = "North Campus"

[limits]
refresh_policy = "fixed"
baseline_window = { days = 90 }

[kpi]
interval = "quarter"

[[tolerance]]
machine_id = "LA1"
test_type = "output_6x"
low = 98.0
high = 102.0
"#;
        let warnings = validate_unknown_keys(toml_str);
        assert!(warnings.is_empty(), "Expected 0 warnings, got: {warnings:?}");
    }

    #[test]
    fn test_unknown_section_produces_warning() {
        let warnings = validate_unknown_keys("[alerts]\nemail = \"qa@example.org\"\n");
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.field == "alerts"));
    }

    #[test]
    fn test_suggest_correction_no_match_for_garbage() {
        let known = known_config_keys();
        assert!(suggest_correction("zzzzzzzzzzzzzzzz", &known).is_none());
    }

    #[test]
    fn test_ranges_defaults_clean() {
        let (errors, warnings) = validate_ranges(&EngineConfig::default());
        assert!(errors.is_empty(), "{errors:?}");
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn test_bad_server_addr_is_error() {
        let mut config = EngineConfig::default();
        config.server.addr = "localhost".to_string();
        let (errors, _) = validate_ranges(&config);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_tiny_baseline_warns() {
        let mut config = EngineConfig::default();
        config.limits.min_baseline_count = 3;
        let (errors, warnings) = validate_ranges(&config);
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.field == "limits.min_baseline_count"));
    }
}
