//! On-demand inspector payload for the debug dashboard.

use serde::Serialize;

use crate::bridge::ServerStatus;
use crate::cache::CacheStats;
use crate::checker::WorkerStatus;
use crate::config::AnalysisConfig;
use crate::diagnostics::AnalysisResult;
use crate::logging::LogEntry;
use crate::tracer::SpanSnapshot;

/// Aggregate snapshot assembled per request and never retained.
///
/// Built by [`crate::bridge::AnalysisBridge::inspector_data`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectorData {
    pub status: ServerStatus,
    pub result_cache: CacheStats,
    pub type_cache: CacheStats,
    /// Live checker workers.
    pub processes: Vec<WorkerStatus>,
    /// Linter children currently running.
    pub linter_running: usize,
    /// Requests waiting in the bridge queue.
    pub queued: usize,
    /// Analyses currently in flight.
    pub active: usize,
    pub recent_traces: Vec<SpanSnapshot>,
    pub recent_results: Vec<AnalysisResult>,
    pub recent_logs: Vec<LogEntry>,
    pub config: AnalysisConfig,
}
