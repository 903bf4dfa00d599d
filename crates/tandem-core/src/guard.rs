//! Type-expansion guard.
//!
//! Bounds nested type expansion so a recursive generic cannot stall the
//! editor. The stack is a per-analysis context; concurrent analyses each
//! carry their own guard.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use smol_str::SmolStr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Snapshot of one expansion-depth check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeExpansionInfo {
    pub type_name: SmolStr,
    pub depth: usize,
    pub max_depth: usize,
    pub truncated: bool,
    /// Enclosing type names at the moment of the check, outermost first.
    pub path: Vec<SmolStr>,
}

/// Notified when an expansion is truncated. Implementations must not assume
/// they run on any particular task; panics are contained.
pub trait ExpansionObserver: Send + Sync {
    fn on_truncation(&self, info: &TypeExpansionInfo);
}

enum Matcher {
    Pattern(Regex),
    /// Immediate self-application, e.g. `List<List<`. The head is matched
    /// with two captures and compared in code; the regex engine has no
    /// backreferences.
    SelfApplication,
}

struct ExpansionPattern {
    name: &'static str,
    matcher: Matcher,
    max_depth: usize,
}

impl ExpansionPattern {
    fn regex(name: &'static str, pattern: &str, max_depth: usize) -> Option<Self> {
        Regex::new(pattern).ok().map(|regex| ExpansionPattern {
            name,
            matcher: Matcher::Pattern(regex),
            max_depth,
        })
    }

    fn matches(&self, type_name: &str) -> bool {
        match &self.matcher {
            Matcher::Pattern(regex) => regex.is_match(type_name),
            Matcher::SelfApplication => is_self_application(type_name),
        }
    }
}

/// Known pathological shapes with their suggested depth ceilings.
static EXPANSION_PATTERNS: Lazy<Vec<ExpansionPattern>> = Lazy::new(|| {
    [
        // Generated ORM payload types explode combinatorially.
        ExpansionPattern::regex("orm-payload", r"(GetPayload|Payload<|Delegate<|Args<)", 15),
        // Recursive router/procedure records (API routers).
        ExpansionPattern::regex("recursive-router", r"(Router<|RouterRecord|Procedure<)", 20),
        Some(ExpansionPattern {
            name: "self-referential",
            matcher: Matcher::SelfApplication,
            max_depth: 16,
        }),
        // Deep mapped/conditional utility chains tolerate more depth.
        ExpansionPattern::regex("mapped-utility", r"^(DeepPartial|DeepReadonly|DeepRequired)\b", 40),
        ExpansionPattern::regex("builder-chain", r"Builder<.*Builder<", 24),
    ]
    .into_iter()
    .flatten()
    .collect()
});

static SELF_APPLICATION_HEAD: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(\w+)\s*<\s*(\w+)\s*<").ok());

fn is_self_application(type_name: &str) -> bool {
    SELF_APPLICATION_HEAD
        .as_ref()
        .and_then(|pattern| pattern.captures(type_name))
        .is_some_and(|captures| {
            captures.get(1).map(|m| m.as_str()) == captures.get(2).map(|m| m.as_str())
        })
}

/// Returns the matched pattern name and its suggested depth ceiling.
pub fn match_pattern(type_name: &str) -> Option<(&'static str, usize)> {
    EXPANSION_PATTERNS
        .iter()
        .find(|pattern| pattern.matches(type_name))
        .map(|pattern| (pattern.name, pattern.max_depth))
}

/// Depth tracker for one analysis.
pub struct ExpansionGuard {
    stack: Vec<SmolStr>,
    max_depth: usize,
    truncation_count: u64,
    observer: Option<Arc<dyn ExpansionObserver>>,
}

impl ExpansionGuard {
    pub fn new(max_depth: usize) -> Self {
        Self {
            stack: Vec::new(),
            max_depth: max_depth.max(1),
            truncation_count: 0,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExpansionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn push(&mut self, name: &str) {
        self.stack.push(SmolStr::new(name));
    }

    pub fn pop(&mut self) -> Option<SmolStr> {
        self.stack.pop()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn truncations(&self) -> u64 {
        self.truncation_count
    }

    /// Checks `depth` against the effective ceiling for `name`.
    ///
    /// The effective ceiling is the configured maximum, lowered further when
    /// the name matches a known pathological pattern. A truncation bumps the
    /// counter, logs a warning, and notifies the observer.
    pub fn check(&mut self, name: &str, depth: usize) -> TypeExpansionInfo {
        let pattern = match_pattern(name);
        let effective_max = pattern
            .map(|(_, suggested)| suggested.min(self.max_depth))
            .unwrap_or(self.max_depth);
        let truncated = depth >= effective_max;
        let info = TypeExpansionInfo {
            type_name: SmolStr::new(name),
            depth,
            max_depth: effective_max,
            truncated,
            path: self.stack.clone(),
        };
        if truncated {
            self.truncation_count += 1;
            match pattern {
                Some((pattern_name, _)) => warn!(
                    "Type expansion truncated at depth {depth} for '{name}' (pattern: {pattern_name})"
                ),
                None => warn!("Type expansion truncated at depth {depth} for '{name}'"),
            }
            if let Some(observer) = &self.observer {
                let observer = observer.clone();
                let snapshot = info.clone();
                // Observer panics stay with the observer.
                let _ = catch_unwind(AssertUnwindSafe(move || {
                    observer.on_truncation(&snapshot);
                }));
            }
        }
        info
    }

    /// First name repeated within the last `window` stack entries.
    pub fn detect_cycle(&self, window: usize) -> Option<SmolStr> {
        let tail_start = self.stack.len().saturating_sub(window);
        let tail = &self.stack[tail_start..];
        for (index, name) in tail.iter().enumerate() {
            if tail[index + 1..].contains(name) {
                return Some(name.clone());
            }
        }
        None
    }
}

/// Human-readable truncation report with a mitigation hint.
pub fn format_report(info: &TypeExpansionInfo) -> String {
    let mut report = String::new();
    report.push_str(&format!(
        "Type expansion truncated: '{}' reached depth {} (limit {})\n",
        info.type_name, info.depth, info.max_depth
    ));
    if !info.path.is_empty() {
        report.push_str("Expansion path:\n");
        for (index, name) in info.path.iter().enumerate() {
            report.push_str(&format!("{:indent$}{name}\n", "", indent = index * 2));
        }
    }
    report.push_str(
        "Consider annotating the value with an explicit type or raising checker.max_type_depth.",
    );
    report
}

/// Truncates a rendered type at the guard's effective depth.
///
/// Walks the `<`/`>` nesting of `display`, checking the guard at each open
/// bracket; content beyond a truncated level collapses to `…`.
pub fn truncate_display(guard: &mut ExpansionGuard, display: &str) -> String {
    let mut out = String::with_capacity(display.len());
    let mut depth = 0usize;
    let mut skip_above: Option<usize> = None;
    let mut segment_start = 0usize;
    for (index, ch) in display.char_indices() {
        match ch {
            '<' => {
                let name = display[segment_start..index]
                    .trim_start_matches(',')
                    .trim()
                    .to_string();
                if skip_above.is_none() {
                    let info = guard.check(&name, depth);
                    if info.truncated {
                        skip_above = Some(depth);
                        out.push('…');
                    } else {
                        out.push('<');
                    }
                }
                guard.push(&name);
                depth += 1;
                segment_start = index + 1;
            }
            '>' => {
                guard.pop();
                depth = depth.saturating_sub(1);
                match skip_above {
                    Some(at) if depth < at => {
                        skip_above = None;
                        out.push('>');
                    }
                    Some(_) => {}
                    None => out.push('>'),
                }
                segment_start = index + 1;
            }
            _ => {
                if skip_above.is_none() {
                    out.push(ch);
                }
            }
        }
    }
    out
}
