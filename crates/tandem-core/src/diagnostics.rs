//! Canonical diagnostic model and merge rules.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Canonical severity scale shared by both analyzers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Hint,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Hint => "hint",
        }
    }

    /// Normalize a raw checker severity string.
    pub fn from_checker_raw(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "info" | "information" => Some(Severity::Info),
            "hint" | "suggestion" => Some(Severity::Hint),
            _ => None,
        }
    }

    /// Normalize a raw linter severity string.
    pub fn from_linter_raw(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" | "deny" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "info" | "advice" => Some(Severity::Info),
            "hint" | "help" => Some(Severity::Hint),
            _ => None,
        }
    }
}

/// Which analyzer produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSource {
    Checker,
    Linter,
    Turbo,
}

impl DiagnosticSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticSource::Checker => "checker",
            DiagnosticSource::Linter => "linter",
            DiagnosticSource::Turbo => "turbo",
        }
    }
}

/// A structured finding attached to a source location.
///
/// Positions are 1-based; `(end_line, end_column)` never precedes
/// `(line, column)` when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub file: SmolStr,
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_column: Option<u32>,
    pub message: String,
    pub severity: Severity,
    pub source: DiagnosticSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<SmolStr>,
    #[serde(default)]
    pub compute_time_ms: u64,
    /// Opaque payload (fix edits, help text) for downstream quick-fix surfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<serde_json::Value>,
}

impl Diagnostic {
    /// Clamps positions to the 1-based invariant and drops an end position
    /// that precedes the start.
    pub fn normalized(mut self) -> Self {
        self.line = self.line.max(1);
        self.column = self.column.max(1);
        if let (Some(end_line), Some(end_column)) = (self.end_line, self.end_column) {
            if (end_line, end_column) < (self.line, self.column) {
                self.end_line = None;
                self.end_column = None;
            }
        }
        self
    }

    fn merge_key(&self) -> (SmolStr, u32, u32, String) {
        (
            self.file.clone(),
            self.line,
            self.column,
            self.message.clone(),
        )
    }
}

/// Result of one analysis pass over a single file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub uri: SmolStr,
    /// Digest of the exact bytes analyzed, rendered as hex.
    pub content_hash: String,
    pub diagnostics: Vec<Diagnostic>,
    pub analysis_time_ms: u64,
    pub from_cache: bool,
}

/// Merges checker and linter diagnostics.
///
/// Duplicates share `(file, line, column, message)`; the checker's record wins.
/// The merged list is ordered by the stable key `(file, line, column, source)`.
pub fn merge_diagnostics(
    checker: Vec<Diagnostic>,
    linter: Vec<Diagnostic>,
) -> Vec<Diagnostic> {
    let mut merged: FxHashMap<(SmolStr, u32, u32, String), Diagnostic> = FxHashMap::default();
    for diagnostic in checker {
        merged.insert(diagnostic.merge_key(), diagnostic);
    }
    for diagnostic in linter {
        merged.entry(diagnostic.merge_key()).or_insert(diagnostic);
    }
    let mut list: Vec<Diagnostic> = merged.into_values().collect();
    sort_stable(&mut list);
    list
}

/// Stable presentation order for diagnostic lists.
pub fn sort_stable(diagnostics: &mut [Diagnostic]) {
    diagnostics.sort_by(|a, b| {
        (a.file.as_str(), a.line, a.column, a.source).cmp(&(
            b.file.as_str(),
            b.line,
            b.column,
            b.source,
        ))
    });
}
