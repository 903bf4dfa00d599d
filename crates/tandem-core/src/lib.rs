//! `tandem-core` - analysis coordination engine.
//!
//! Sits between an editor client and two external analyzer binaries (a type
//! checker and a linter). Accepts per-file analysis requests, runs them with
//! bounded concurrency across a persistent checker pool and an ephemeral
//! linter pool, merges the diagnostics, and caches results by content hash.

pub mod bridge;
pub mod cache;
pub mod checker;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod guard;
pub mod hash;
pub mod inspector;
pub mod linter;
pub mod logging;
pub mod protocol;
pub mod tracer;
pub mod type_cache;

pub use bridge::{AnalysisBridge, Priority, ServerStatus};
pub use cache::{CacheStats, ResultCache};
pub use config::AnalysisConfig;
pub use diagnostics::{AnalysisResult, Diagnostic, DiagnosticSource, Severity};
pub use error::AnalysisError;
pub use guard::{ExpansionGuard, ExpansionObserver, TypeExpansionInfo};
pub use hash::content_hash;
pub use inspector::InspectorData;
pub use logging::{LogEntry, LogLevel, StructuredLogger};
pub use tracer::{PerfTracer, SpanObserver, SpanSnapshot};
pub use type_cache::TypeCache;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
