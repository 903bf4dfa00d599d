//! Analysis bridge.
//!
//! The dispatcher between callers and the analyzer pools: a priority queue
//! with per-uri dedup, bounded-concurrency fan-out to both pools, merge with
//! checker-wins dedup, and the content-hash result cache in front of it all.

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use smol_str::SmolStr;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheStats, ResultCache};
use crate::checker::{CheckerPool, WorkerStatus};
use crate::config::AnalysisConfig;
use crate::diagnostics::{merge_diagnostics, AnalysisResult, Diagnostic};
use crate::epoch_ms;
use crate::error::AnalysisError;
use crate::guard::{truncate_display, ExpansionGuard, ExpansionObserver};
use crate::hash::{content_hash, hash_hex};
use crate::inspector::InspectorData;
use crate::linter::LinterPool;
use crate::logging::{FileSink, StructuredLogger};
use crate::protocol::{Completion, TypeInfo};
use crate::tracer::PerfTracer;
use crate::type_cache::TypeCache;

/// Merged results retained for the inspector.
const RECENT_RESULTS: usize = 50;

/// Scheduling class; lower number dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Active = 0,
    Open = 1,
    Background = 2,
}

/// Coordinator state as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Starting,
    Ready,
    Busy,
    Degraded,
    Error,
}

/// What the result cache stores per uri.
#[derive(Debug, Clone, Serialize)]
struct CachedAnalysis {
    diagnostics: Vec<Diagnostic>,
    analysis_time_ms: u64,
}

/// Type info per `line:column` position, cached per uri.
type PositionTypes = IndexMap<String, TypeInfo>;

struct QueuedRequest {
    uri: SmolStr,
    content: String,
    priority: Priority,
    seq: u64,
    enqueued_at_ms: u64,
    reply: oneshot::Sender<Result<AnalysisResult, AnalysisError>>,
}

struct BridgeInner {
    config: RwLock<AnalysisConfig>,
    checker: CheckerPool,
    linter: LinterPool,
    result_cache: Mutex<ResultCache<CachedAnalysis>>,
    type_cache: Mutex<TypeCache<PositionTypes>>,
    tracer: Arc<PerfTracer>,
    logger: StructuredLogger,
    expansion_observer: Mutex<Option<Arc<dyn ExpansionObserver>>>,
    queue: Mutex<Vec<QueuedRequest>>,
    seq: AtomicU64,
    active: AtomicUsize,
    started: AtomicBool,
    shutting_down: AtomicBool,
    degraded: AtomicBool,
    bootstrap_failed: AtomicBool,
    recent: Mutex<VecDeque<AnalysisResult>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

/// The coordinator handle.
#[derive(Clone)]
pub struct AnalysisBridge {
    inner: Arc<BridgeInner>,
}

impl AnalysisBridge {
    pub fn new(config: AnalysisConfig) -> Self {
        let checker = CheckerPool::new(config.checker.clone());
        let linter = LinterPool::new(config.linter.clone());
        let tracer = Arc::new(PerfTracer::new(
            config.inspector.max_trace_history,
            config.inspector.slow_span_ms,
        ));
        let logger = StructuredLogger::new(config.logging.ring_capacity, config.logging.level);
        if let Some(path) = &config.logging.file {
            logger.set_sink(Arc::new(FileSink::new(
                path.clone(),
                config.logging.max_file_size_mb.saturating_mul(1024 * 1024),
                config.logging.pretty_print,
            )));
        }
        let cache = &config.cache;
        let result_cache = ResultCache::new(cache.max_entries, cache.max_bytes(), cache.ttl_ms());
        let type_cache = TypeCache::new(cache.max_entries, cache.max_bytes(), cache.ttl_ms());
        Self {
            inner: Arc::new(BridgeInner {
                config: RwLock::new(config),
                checker,
                linter,
                result_cache: Mutex::new(result_cache),
                type_cache: Mutex::new(type_cache),
                tracer,
                logger,
                expansion_observer: Mutex::new(None),
                queue: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                degraded: AtomicBool::new(false),
                bootstrap_failed: AtomicBool::new(false),
                recent: Mutex::new(VecDeque::new()),
                flusher: Mutex::new(None),
            }),
        }
    }

    /// Boots the pools and the log flusher.
    ///
    /// A checker that fails to start degrades the coordinator instead of
    /// stopping it, unless the linter is disabled too and nothing could run.
    pub async fn start(&self) -> Result<(), AnalysisError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (flush_interval_ms, checker_enabled, linter_enabled) = {
            let config = self.inner.config.read();
            (
                config.logging.flush_interval_ms,
                config.checker.enabled,
                config.linter.enabled,
            )
        };
        *self.inner.flusher.lock() = Some(self.inner.logger.spawn_flusher(flush_interval_ms));

        if checker_enabled {
            if let Err(err) = self.inner.checker.start().await {
                warn!("Checker pool failed to start: {err}");
                self.inner
                    .logger
                    .error(format!("checker pool failed to start: {err}"));
                self.inner.degraded.store(true, Ordering::SeqCst);
                if !linter_enabled {
                    self.inner.bootstrap_failed.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        info!("Analysis bridge ready");
        self.inner.logger.info("analysis bridge ready");
        Ok(())
    }

    /// Runs both enabled analyzers for the file and returns merged
    /// diagnostics. Cache-first unless `force`; one queued request per uri,
    /// newer requests supersede older queued ones.
    pub async fn analyze(
        &self,
        uri: &str,
        content: &str,
        force: bool,
        priority: Priority,
    ) -> Result<AnalysisResult, AnalysisError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(AnalysisError::ShuttingDown);
        }
        let hash = content_hash(content.as_bytes());
        if !force && self.inner.config.read().cache.enabled {
            let cached = self.inner.result_cache.lock().get(uri, hash);
            if let Some(cached) = cached {
                return Ok(AnalysisResult {
                    uri: SmolStr::new(uri),
                    content_hash: hash_hex(hash),
                    diagnostics: cached.diagnostics,
                    analysis_time_ms: cached.analysis_time_ms,
                    from_cache: true,
                });
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut queue = self.inner.queue.lock();
            if let Some(index) = queue.iter().position(|item| item.uri == uri) {
                let superseded = queue.swap_remove(index);
                let _ = superseded
                    .reply
                    .send(Err(AnalysisError::Superseded(superseded.uri)));
            }
            queue.push(QueuedRequest {
                uri: SmolStr::new(uri),
                content: content.to_string(),
                priority,
                seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
                enqueued_at_ms: epoch_ms(),
                reply: reply_tx,
            });
        }
        self.inner.pump();
        reply_rx.await.map_err(|_| AnalysisError::ChannelClosed)?
    }

    /// Type information at a position, guarded against runaway expansion and
    /// cached per content hash.
    pub async fn type_info(
        &self,
        uri: &str,
        content: &str,
        line: u32,
        column: u32,
    ) -> Result<Option<TypeInfo>, AnalysisError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(AnalysisError::ShuttingDown);
        }
        let hash = content_hash(content.as_bytes());
        let position = format!("{line}:{column}");
        let cache_enabled = self.inner.config.read().cache.enabled;
        if cache_enabled {
            let cached = self.inner.type_cache.lock().get(uri, hash);
            if let Some(types) = cached {
                if let Some(info) = types.get(&position) {
                    return Ok(Some(info.clone()));
                }
            }
        }

        let info = self.inner.checker.type_info(uri, content, line, column).await?;
        let info = info.map(|info| self.inner.bound_expansion(info));
        if cache_enabled {
            if let Some(info) = &info {
                let mut cache = self.inner.type_cache.lock();
                let mut types = cache.get(uri, hash).unwrap_or_default();
                types.insert(position, info.clone());
                cache.set(uri, hash, types);
            }
        }
        Ok(info)
    }

    /// Completion items at a position (straight pass-through).
    pub async fn completions(
        &self,
        uri: &str,
        content: &str,
        line: u32,
        column: u32,
    ) -> Result<Vec<Completion>, AnalysisError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(AnalysisError::ShuttingDown);
        }
        self.inner.checker.completions(uri, content, line, column).await
    }

    /// Records `from` importing `to` in the dependency graph.
    pub fn add_dependency(&self, from: &str, to: &str) {
        self.inner.type_cache.lock().add_dependency(from, to);
    }

    /// Drops the outgoing edges of `from` ahead of re-analysis.
    pub fn clear_dependencies(&self, from: &str) {
        self.inner.type_cache.lock().clear_dependencies(from);
    }

    /// Invalidates `uri` and everything that depends on it, transitively.
    pub fn invalidate_cascade(&self, uri: &str) -> Vec<SmolStr> {
        let invalidated = self.inner.type_cache.lock().invalidate_cascade(uri);
        {
            let mut results = self.inner.result_cache.lock();
            for file in &invalidated {
                results.invalidate(file);
            }
        }
        invalidated.into_iter().collect()
    }

    /// Removes the cached result for one uri.
    pub fn invalidate(&self, uri: &str) {
        self.inner.result_cache.lock().invalidate(uri);
    }

    /// Wipes both caches; returns their fresh stats.
    pub fn clear_caches(&self) -> (CacheStats, CacheStats) {
        let result_stats = {
            let mut cache = self.inner.result_cache.lock();
            cache.clear();
            cache.stats()
        };
        let type_stats = {
            let mut cache = self.inner.type_cache.lock();
            cache.clear();
            cache.stats()
        };
        (result_stats, type_stats)
    }

    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (
            self.inner.result_cache.lock().stats(),
            self.inner.type_cache.lock().stats(),
        )
    }

    /// Hot-applies new settings to the bridge, the pools, the caches, the
    /// tracer, and the log core.
    pub fn update_config(&self, config: AnalysisConfig) {
        self.inner.checker.update_config(config.checker.clone());
        self.inner.linter.update_config(config.linter.clone());
        let cache = &config.cache;
        self.inner
            .result_cache
            .lock()
            .configure(cache.max_entries, cache.max_bytes(), cache.ttl_ms());
        self.inner
            .type_cache
            .lock()
            .configure(cache.max_entries, cache.max_bytes(), cache.ttl_ms());
        self.inner
            .tracer
            .set_slow_threshold_ms(config.inspector.slow_span_ms);
        self.inner
            .tracer
            .set_max_roots(config.inspector.max_trace_history);
        self.inner.logger.set_level(config.logging.level);
        match &config.logging.file {
            Some(path) => self.inner.logger.set_sink(Arc::new(FileSink::new(
                path.clone(),
                config.logging.max_file_size_mb.saturating_mul(1024 * 1024),
                config.logging.pretty_print,
            ))),
            None => self.inner.logger.clear_sink(),
        }
        *self.inner.config.write() = config;
    }

    pub fn config(&self) -> AnalysisConfig {
        self.inner.config.read().clone()
    }

    pub fn status(&self) -> ServerStatus {
        if self.inner.bootstrap_failed.load(Ordering::SeqCst) {
            return ServerStatus::Error;
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return ServerStatus::Starting;
        }
        if self.inner.degraded.load(Ordering::SeqCst) {
            return ServerStatus::Degraded;
        }
        if self.inner.active.load(Ordering::SeqCst) > 0 {
            return ServerStatus::Busy;
        }
        ServerStatus::Ready
    }

    /// Most recent merged results, newest first.
    pub fn recent_results(&self, limit: usize) -> Vec<AnalysisResult> {
        let recent = self.inner.recent.lock();
        recent.iter().rev().take(limit).cloned().collect()
    }

    pub fn workers(&self) -> Vec<WorkerStatus> {
        self.inner.checker.workers()
    }

    /// The shared structured log core.
    pub fn logger(&self) -> &StructuredLogger {
        &self.inner.logger
    }

    /// The shared tracer.
    pub fn tracer(&self) -> &Arc<PerfTracer> {
        &self.inner.tracer
    }

    pub fn set_expansion_observer(&self, observer: Arc<dyn ExpansionObserver>) {
        *self.inner.expansion_observer.lock() = Some(observer);
    }

    /// On-demand aggregate for the debug dashboard; nothing is retained.
    pub fn inspector_data(&self) -> InspectorData {
        let (result_cache, type_cache) = self.cache_stats();
        InspectorData {
            status: self.status(),
            result_cache,
            type_cache,
            processes: self.inner.checker.workers(),
            linter_running: self.inner.linter.running(),
            queued: self.inner.queue.lock().len(),
            active: self.inner.active.load(Ordering::SeqCst),
            recent_traces: self.inner.tracer.recent(20),
            recent_results: self.recent_results(10),
            recent_logs: self.inner.logger.snapshot(50),
            config: self.config(),
        }
    }

    /// Fails queued work, stops both pools, and flushes the log core.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Analysis bridge shutting down");
        let queued = std::mem::take(&mut *self.inner.queue.lock());
        for item in queued {
            let _ = item.reply.send(Err(AnalysisError::ShuttingDown));
        }
        self.inner.checker.shutdown().await;
        self.inner.linter.shutdown();
        if let Some(flusher) = self.inner.flusher.lock().take() {
            flusher.abort();
        }
        self.inner.logger.flush();
    }
}

impl BridgeInner {
    /// Dispatches queued requests while concurrency allows.
    fn pump(self: &Arc<Self>) {
        loop {
            let max_concurrent = self.config.read().max_concurrent.get();
            let item = {
                let mut queue = self.queue.lock();
                if queue.is_empty() {
                    return;
                }
                if self.active.load(Ordering::SeqCst) >= max_concurrent {
                    return;
                }
                let Some(index) = next_index(&queue) else {
                    return;
                };
                self.active.fetch_add(1, Ordering::SeqCst);
                queue.remove(index)
            };
            let inner = self.clone();
            tokio::spawn(async move {
                inner.run(item).await;
            });
        }
    }

    /// One full fan-out: both analyzers in parallel with settle-all
    /// semantics, merge, cache store, tracing.
    async fn run(self: Arc<Self>, item: QueuedRequest) {
        let started = Instant::now();
        let hash = content_hash(item.content.as_bytes());
        let mut metadata = Map::new();
        metadata.insert("uri".to_string(), Value::String(item.uri.to_string()));
        metadata.insert(
            "queuedMs".to_string(),
            Value::from(epoch_ms().saturating_sub(item.enqueued_at_ms)),
        );
        let root = self.tracer.start("analyzeFile", None, Some(metadata));

        let (checker_enabled, linter_enabled) = {
            let config = self.config.read();
            (config.checker.enabled, config.linter.enabled)
        };

        let checker_diagnostics = async {
            if !checker_enabled {
                return Vec::new();
            }
            let span = self.tracer.start("checker.analyze", Some(root), None);
            let outcome = self.checker.analyze(&item.uri, &item.content).await;
            self.tracer.end(span, None);
            match outcome {
                Ok(analysis) => analysis.diagnostics,
                Err(err) => {
                    // One analyzer failing must not suppress the other.
                    warn!("Checker failed for {}: {err}", item.uri);
                    self.logger
                        .warn(format!("checker failed for {}: {err}", item.uri));
                    Vec::new()
                }
            }
        };
        let linter_diagnostics = async {
            if !linter_enabled {
                return Vec::new();
            }
            let span = self.tracer.start("linter.lint", Some(root), None);
            let outcome = self.linter.lint(&item.uri, &item.content).await;
            self.tracer.end(span, None);
            match outcome {
                Ok(analysis) => analysis.diagnostics,
                Err(err) => {
                    warn!("Linter failed for {}: {err}", item.uri);
                    self.logger
                        .warn(format!("linter failed for {}: {err}", item.uri));
                    Vec::new()
                }
            }
        };
        let (checker_diagnostics, linter_diagnostics) =
            tokio::join!(checker_diagnostics, linter_diagnostics);

        let diagnostics = merge_diagnostics(checker_diagnostics, linter_diagnostics);
        let analysis_time_ms = started.elapsed().as_millis() as u64;
        let result = AnalysisResult {
            uri: item.uri.clone(),
            content_hash: hash_hex(hash),
            diagnostics,
            analysis_time_ms,
            from_cache: false,
        };

        if self.config.read().cache.enabled {
            self.result_cache.lock().set(
                &item.uri,
                hash,
                CachedAnalysis {
                    diagnostics: result.diagnostics.clone(),
                    analysis_time_ms,
                },
            );
        }
        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_RESULTS {
                recent.pop_front();
            }
            recent.push_back(result.clone());
        }

        let mut end_metadata = Map::new();
        end_metadata.insert(
            "diagnostics".to_string(),
            Value::from(result.diagnostics.len()),
        );
        self.tracer.end(root, Some(end_metadata));

        let _ = item.reply.send(Ok(result));
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.pump();
    }

    /// Applies the expansion guard to a rendered type.
    fn bound_expansion(&self, info: TypeInfo) -> TypeInfo {
        let max_depth = self.config.read().checker.max_type_depth;
        let mut guard = ExpansionGuard::new(max_depth);
        if let Some(observer) = self.expansion_observer.lock().clone() {
            guard = guard.with_observer(observer);
        }
        let display = truncate_display(&mut guard, &info.display);
        TypeInfo { display, ..info }
    }
}

/// Index of the next dispatchable item: lowest priority number first, FIFO
/// within a priority level.
fn next_index(queue: &[QueuedRequest]) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .min_by_key(|(_, item)| (item.priority, item.seq))
        .map(|(index, _)| index)
}
