//! Structured logging core.
//!
//! A process-local ring buffer plus a batch flusher. Inspector readers take
//! snapshots of the ring; they never consume it. Delivery happens through a
//! [`LogSink`] that receives each flushed batch.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use smol_str::SmolStr;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::epoch_ms;

/// Log severity, ordered from chattiest to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "fatal" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

/// One structured entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    pub source: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<u64>,
}

/// Receives flushed batches; delivery to the editor or a file lives here.
pub trait LogSink: Send + Sync {
    fn emit(&self, batch: &[LogEntry]);
}

#[derive(Debug)]
struct LogRing {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogRing {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4_096)),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn snapshot(&self, limit: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

struct LoggerShared {
    ring: Mutex<LogRing>,
    batch: Mutex<Vec<LogEntry>>,
    level: RwLock<LogLevel>,
    sink: RwLock<Option<Arc<dyn LogSink>>>,
}

/// Handle to the shared log core. Clones and child loggers share the ring,
/// the batch, and the sink; children add their own static context.
#[derive(Clone)]
pub struct StructuredLogger {
    shared: Arc<LoggerShared>,
    source: SmolStr,
    context: Map<String, Value>,
}

impl StructuredLogger {
    pub fn new(capacity: usize, level: LogLevel) -> Self {
        Self {
            shared: Arc::new(LoggerShared {
                ring: Mutex::new(LogRing::new(capacity)),
                batch: Mutex::new(Vec::new()),
                level: RwLock::new(level),
                sink: RwLock::new(None),
            }),
            source: SmolStr::new("tandem"),
            context: Map::new(),
        }
    }

    /// Derives a logger sharing this ring and flusher, with `context` merged
    /// into every entry it emits.
    pub fn child(&self, source: &str, context: Map<String, Value>) -> Self {
        let mut merged = self.context.clone();
        merged.extend(context);
        Self {
            shared: self.shared.clone(),
            source: SmolStr::new(source),
            context: merged,
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        *self.shared.level.write() = level;
    }

    pub fn set_sink(&self, sink: Arc<dyn LogSink>) {
        *self.shared.sink.write() = Some(sink);
    }

    pub fn clear_sink(&self) {
        *self.shared.sink.write() = None;
    }

    pub fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        context: Option<Map<String, Value>>,
        span_id: Option<u64>,
    ) {
        if level < *self.shared.level.read() {
            return;
        }
        let mut merged = self.context.clone();
        if let Some(extra) = context {
            merged.extend(extra);
        }
        let entry = LogEntry {
            timestamp_ms: epoch_ms(),
            level,
            message: message.into(),
            context: merged,
            source: self.source.clone(),
            span_id,
        };
        self.shared.ring.lock().push(entry.clone());
        self.shared.batch.lock().push(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, None, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, None, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, None, None);
    }

    /// Forces an immediate flush of the pending batch to the sink.
    pub fn flush(&self) {
        let batch: Vec<LogEntry> = {
            let mut pending = self.shared.batch.lock();
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return;
        }
        let sink = self.shared.sink.read().clone();
        if let Some(sink) = sink {
            // Sink panics must not poison producers.
            let _ = catch_unwind(AssertUnwindSafe(|| sink.emit(&batch)));
        }
    }

    /// Most recent ring entries, oldest first.
    pub fn snapshot(&self, limit: usize) -> Vec<LogEntry> {
        self.shared.ring.lock().snapshot(limit)
    }

    pub fn ring_len(&self) -> usize {
        self.shared.ring.lock().entries.len()
    }

    /// Spawns the periodic batch flusher. The caller owns the handle and
    /// aborts it at shutdown.
    pub fn spawn_flusher(&self, interval_ms: u64) -> JoinHandle<()> {
        let logger = self.clone();
        tokio::spawn(async move {
            let period = std::time::Duration::from_millis(interval_ms.max(10));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                logger.flush();
            }
        })
    }
}

/// File sink with size-based rotation: one numbered backup, older rotations
/// discarded.
pub struct FileSink {
    path: PathBuf,
    max_bytes: u64,
    pretty: bool,
    guard: Mutex<()>,
}

impl FileSink {
    pub fn new(path: PathBuf, max_bytes: u64, pretty: bool) -> Self {
        Self {
            path,
            max_bytes: max_bytes.max(1),
            pretty,
            guard: Mutex::new(()),
        }
    }

    fn rotate_if_needed(&self) {
        let size = fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0);
        if size < self.max_bytes {
            return;
        }
        let backup = self.path.with_extension("log.1");
        if let Err(err) = fs::rename(&self.path, &backup) {
            warn!("Failed to rotate log file {}: {err}", self.path.display());
        }
    }

    fn render(&self, entry: &LogEntry) -> String {
        if self.pretty {
            let context = if entry.context.is_empty() {
                String::new()
            } else {
                format!(" {}", Value::Object(entry.context.clone()))
            };
            format!(
                "[{}] {} {}: {}{}",
                entry.timestamp_ms,
                entry.level.as_str().to_ascii_uppercase(),
                entry.source,
                entry.message,
                context
            )
        } else {
            serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string())
        }
    }
}

impl LogSink for FileSink {
    fn emit(&self, batch: &[LogEntry]) {
        let _guard = self.guard.lock();
        self.rotate_if_needed();
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("Failed to create log directory {}: {err}", parent.display());
                return;
            }
        }
        let mut file = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) => {
                warn!("Failed to open log file {}: {err}", self.path.display());
                return;
            }
        };
        for entry in batch {
            if let Err(err) = writeln!(file, "{}", self.render(entry)) {
                warn!("Failed to write log entry: {err}");
                return;
            }
        }
    }
}
