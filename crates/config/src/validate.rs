//! Configuration validation engine.
//!
//! Validates TOML configuration files against the known schema, detects
//! unknown/misspelled fields, and reports settings that parse but cannot
//! work as intended.

use std::{collections::HashMap, path::Path};

use crate::schema::{PlughubConfig, RestartPolicy};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "semantic", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "health.intreval"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    /// Dynamic keys with scalar values (`metrics.labels`).
    OpenMap,
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Leaf, OpenMap, Struct};

    Struct(HashMap::from([
        (
            "plugins",
            Struct(HashMap::from([("dirs", Leaf), ("disabled", Leaf)])),
        ),
        (
            "defaults",
            Struct(HashMap::from([
                ("restart_policy", Leaf),
                ("max_restarts", Leaf),
                ("restart_delay", Leaf),
                ("call_timeout", Leaf),
            ])),
        ),
        (
            "health",
            Struct(HashMap::from([
                ("enabled", Leaf),
                ("interval", Leaf),
                ("probe_timeout", Leaf),
            ])),
        ),
        ("supervisor", Struct(HashMap::from([("event_buffer", Leaf)]))),
        (
            "metrics",
            Struct(HashMap::from([("enabled", Leaf), ("labels", OpenMap)])),
        ),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Closest candidate within `max_distance` edits, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(ref actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "file-ref",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|e| e == "toml");

    let mut result = match std::fs::read_to_string(actual_path) {
        Ok(content) if is_toml => {
            validate_toml_str(&crate::env_subst::substitute_env(&content))
        },
        Ok(_) => match crate::loader::load_config(actual_path) {
            Ok(config) => {
                let mut diagnostics = Vec::new();
                check_semantics(&config, &mut diagnostics);
                ValidationResult {
                    diagnostics,
                    config_path: None,
                }
            },
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic {
                    severity: Severity::Error,
                    category: "type-error",
                    path: String::new(),
                    message: format!("failed to parse config: {e}"),
                }],
                config_path: None,
            },
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("failed to read config file: {e}"),
            }],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path.clone());
    result
}

/// Validate a TOML string without file-system side effects.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("TOML syntax error: {e}"),
            });
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&toml_value, &build_schema_map(), "", &mut diagnostics);

    match toml::from_str::<PlughubConfig>(toml_str) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "type-error",
            path: String::new(),
            message: format!("type error: {e}"),
        }),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let (toml::Value::Table(table), KnownKeys::Struct(fields)) = (value, schema) else {
        return;
    };

    let known: Vec<&str> = fields.keys().copied().collect();
    for (key, child) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match fields.get(key.as_str()) {
            Some(child_schema) => check_unknown_fields(child, child_schema, &path, diagnostics),
            None => {
                let message = match suggest(key, &known, 3) {
                    Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                    None => "unknown field".to_string(),
                };
                diagnostics.push(Diagnostic {
                    severity: Severity::Error,
                    category: "unknown-field",
                    path,
                    message,
                });
            },
        }
    }
}

fn check_semantics(config: &PlughubConfig, diagnostics: &mut Vec<Diagnostic>) {
    if config.health.enabled && config.health.probe_timeout >= config.health.interval {
        diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            category: "semantic",
            path: "health.probe_timeout".into(),
            message: "probe timeout is not shorter than the probe interval; slow workers are probed back to back".into(),
        });
    }

    if config.defaults.call_timeout.is_zero() {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "semantic",
            path: "defaults.call_timeout".into(),
            message: "call timeout must be greater than zero".into(),
        });
    }

    if config.defaults.restart_policy == RestartPolicy::OnFailure
        && config.defaults.max_restarts == 0
    {
        diagnostics.push(Diagnostic {
            severity: Severity::Info,
            category: "semantic",
            path: "defaults.max_restarts".into(),
            message: "on-failure with max_restarts = 0 never restarts; consider restart_policy = \"never\"".into(),
        });
    }

    if config.supervisor.event_buffer == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "semantic",
            path: "supervisor.event_buffer".into(),
            message: "event buffer must hold at least one event".into(),
        });
    }

    for (i, dir) in config.plugins.dirs.iter().enumerate() {
        if !dir.is_dir() {
            diagnostics.push(Diagnostic {
                severity: Severity::Warning,
                category: "file-ref",
                path: format!("plugins.dirs[{i}]"),
                message: format!("directory does not exist: {}", dir.display()),
            });
        }
    }
}
