// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON key-path configuration store for the orchestration service: load,
//! dotted-path get/set, environment-variable overrides, validation, and
//! redaction of sensitive values for diagnostics output.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

/// Fixed environment-variable overrides applied before `${NAME}` placeholder
/// expansion. This is pass (a) of `apply_environment_overrides`; an unset or
/// empty variable is treated as absent and leaves the existing value alone.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("SILICONFLOW_API_KEY", "api.api_key"),
    ("SILICONFLOW_BASE_URL", "api.base_url"),
    ("PROJECT_ROOT", "tools.project_root"),
];

/// Keys whose values must be masked when the document is rendered for
/// diagnostics or logs.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &["api_key", "apikey", "secret", "token", "password"];

/// One validation problem found while checking a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// Result of [`ConfigStore::validate`]: warnings never block startup, errors do.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    /// Render as a flat list of messages, warnings prefixed `WARN:`.
    pub fn messages(&self) -> Vec<String> {
        self.issues
            .iter()
            .map(|i| match i.severity {
                Severity::Warning => format!("WARN: {}: {}", i.path, i.message),
                Severity::Error => format!("{}: {}", i.path, i.message),
            })
            .collect()
    }
}

/// A JSON document addressed by dotted key paths (`"scheduler.max_concurrent_requests"`).
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    root: Value,
}

impl ConfigStore {
    pub fn empty() -> Self {
        Self { root: Value::Object(Default::default()) }
    }

    pub fn load_from_text(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text).context("parsing config document as JSON")?;
        Ok(Self { root })
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::load_from_text(&text)
    }

    /// Read a value by dotted path, expanding `${NAME}` placeholders in any
    /// string leaf against the process environment.
    pub fn get(&self, path: &str) -> Option<Value> {
        let raw = get_path(&self.root, path)?;
        Some(expand_placeholders(raw))
    }

    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).and_then(|v| v.as_str().map(str::to_string).or_else(|| Some(v.to_string())))
    }

    /// Write a value at a dotted path, creating intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: Value) {
        set_path(&mut self.root, path, value);
    }

    /// Apply the fixed set of environment-variable overrides, then recursively
    /// expand `${NAME}` placeholders left in string leaves throughout the
    /// whole document.
    pub fn apply_environment_overrides(&mut self) {
        for (env_var, path) in ENV_OVERRIDES {
            match std::env::var(env_var) {
                Ok(val) if !val.is_empty() => {
                    debug!(env_var, path, "applying environment override");
                    self.set(path, Value::String(val));
                }
                _ => {}
            }
        }
        expand_in_place(&mut self.root);
    }

    /// Validate the document's orchestration-relevant fields.
    ///
    /// A missing API key, a missing base URL, a base URL not starting with
    /// `http(s)://`, and a timeout outside `(0, 300000] ms` are hard errors
    /// (not warnings) — these are the fields the env-override mapping exists
    /// to fill in, so a document that reaches `validate()` without them
    /// cannot serve a single request. Everything else here is an additive
    /// warning-level check this workspace's other components rely on.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        match get_path(&self.root, "api.api_key").and_then(Value::as_str) {
            Some(s) if !s.is_empty() && !looks_like_unresolved_placeholder(s) => {}
            _ => report.issues.push(ValidationIssue {
                path: "api.api_key".into(),
                message: "missing API key (set api.api_key or the SILICONFLOW_API_KEY environment variable)".into(),
                severity: Severity::Error,
            }),
        }

        match get_path(&self.root, "api.base_url").and_then(Value::as_str) {
            None => report.issues.push(ValidationIssue {
                path: "api.base_url".into(),
                message: "missing base URL (set api.base_url or the SILICONFLOW_BASE_URL environment variable)".into(),
                severity: Severity::Error,
            }),
            Some(s) if s.is_empty() => report.issues.push(ValidationIssue {
                path: "api.base_url".into(),
                message: "missing base URL (set api.base_url or the SILICONFLOW_BASE_URL environment variable)".into(),
                severity: Severity::Error,
            }),
            Some(s) if !(s.starts_with("http://") || s.starts_with("https://")) => {
                report.issues.push(ValidationIssue {
                    path: "api.base_url".into(),
                    message: "base URL must start with http:// or https://".into(),
                    severity: Severity::Error,
                })
            }
            Some(_) => {}
        }

        match get_path(&self.root, "api.default_timeout_ms").and_then(|v| v.as_i64()) {
            None => report.issues.push(ValidationIssue {
                path: "api.default_timeout_ms".into(),
                message: "missing timeout".into(),
                severity: Severity::Error,
            }),
            Some(n) if n <= 0 || n > 300_000 => report.issues.push(ValidationIssue {
                path: "api.default_timeout_ms".into(),
                message: "must be in (0, 300000] ms".into(),
                severity: Severity::Error,
            }),
            Some(_) => {}
        }

        check_positive_int(&self.root, "request_manager.max_queue_size", &mut report, Severity::Warning);
        check_positive_int(&self.root, "cache.max_entries", &mut report, Severity::Warning);
        check_positive_int(&self.root, "cache.default_ttl_seconds", &mut report, Severity::Warning);

        if get_path(&self.root, "models").is_none() {
            report.issues.push(ValidationIssue {
                path: "models".into(),
                message: "no models configured; the model registry will start empty".into(),
                severity: Severity::Warning,
            });
        }

        report
    }

    /// Return a deep copy of the document with sensitive leaf values masked,
    /// suitable for logging or diagnostic dumps.
    pub fn redact_sensitive(&self) -> Value {
        redact(&self.root)
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }
}

fn check_positive_int(root: &Value, path: &str, report: &mut ValidationReport, severity: Severity) {
    match get_path(root, path) {
        None => {}
        Some(v) => match v.as_i64() {
            Some(n) if n > 0 => {}
            _ => report.issues.push(ValidationIssue {
                path: path.to_string(),
                message: "must be a positive integer".into(),
                severity,
            }),
        },
    }
}

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !current.is_object() {
        *current = Value::Object(Default::default());
    }
    current.as_object_mut().unwrap().insert(segments[segments.len() - 1].to_string(), value);
}

/// `true` when a string still contains an unresolved `${NAME}` placeholder
/// after expansion has already run against it.
fn looks_like_unresolved_placeholder(s: &str) -> bool {
    s.contains("${") && s.contains('}')
}

/// Expand `${NAME}` placeholders in a single string-or-structured value
/// against the process environment, leaving unresolvable names untouched.
fn expand_placeholders(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(expand_str(s)),
        Value::Array(items) => Value::Array(items.iter().map(expand_placeholders).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), expand_placeholders(v))).collect()),
        other => other.clone(),
    }
}

fn expand_in_place(value: &mut Value) {
    match value {
        Value::String(s) => *s = expand_str(s),
        Value::Array(items) => items.iter_mut().for_each(expand_in_place),
        Value::Object(map) => map.values_mut().for_each(expand_in_place),
        _ => {}
    }
}

fn expand_str(s: &str) -> String {
    match shellexpand::env(s) {
        Ok(expanded) => expanded.into_owned(),
        Err(_) => s.to_string(),
    }
}

fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = is_sensitive_key(k);
                    (k.clone(), if masked { Value::String("***REDACTED***".into()) } else { redact(v) })
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_FRAGMENTS.iter().any(|frag| lower.contains(frag))
}

/// Convenience constructor mirroring [`crate::load`]'s search-path semantics
/// but reading a single JSON document (the orchestration service's native
/// format) instead of the CLI's layered YAML.
pub fn load_store(explicit_path: Option<&Path>) -> Result<ConfigStore> {
    let mut store = match explicit_path {
        Some(p) => ConfigStore::load_from_file(p)?,
        None => {
            let candidates = [
                Path::new("/etc/vane/config.json"),
                Path::new(".vane/config.json"),
                Path::new("vane.json"),
            ];
            match candidates.iter().find(|p| p.is_file()) {
                Some(p) => ConfigStore::load_from_file(p)?,
                None => ConfigStore::empty(),
            }
        }
    };
    store.apply_environment_overrides();
    let report = store.validate();
    for issue in report.warnings() {
        warn!(path = %issue.path, message = %issue.message, "config validation warning");
    }
    if report.has_errors() {
        let summary = report.errors().map(|i| format!("{}: {}", i.path, i.message)).collect::<Vec<_>>().join("; ");
        bail!("config validation failed: {summary}");
    }
    Ok(store)
}
