//! Hierarchical performance tracer.
//!
//! Spans form a tree; children link into their parent when they end, so open
//! parent trees stay queryable. Root history is a bounded deque and the
//! oldest root's subtree is purged wholesale when it overflows.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use smol_str::SmolStr;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::epoch_ms;

/// Notified when a completed span's duration exceeds the slow threshold.
pub trait SpanObserver: Send + Sync {
    fn on_slow_span(&self, span: &SpanSnapshot);
}

/// A resolved span tree, as handed to observers and the inspector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanSnapshot {
    pub id: u64,
    pub name: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    pub start_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub children: Vec<SpanSnapshot>,
}

#[derive(Debug, Clone)]
struct SpanRecord {
    id: u64,
    name: SmolStr,
    parent_id: Option<u64>,
    start_ms: u64,
    end_ms: Option<u64>,
    duration_ms: Option<u64>,
    metadata: Map<String, Value>,
    children: Vec<u64>,
}

#[derive(Debug, Default)]
struct TracerState {
    active: FxHashMap<u64, SpanRecord>,
    completed: FxHashMap<u64, SpanRecord>,
    /// Completed root ids in insertion order.
    roots: VecDeque<u64>,
    next_id: u64,
}

/// The tracer. Cheap to share; all state sits behind one mutex.
pub struct PerfTracer {
    state: Mutex<TracerState>,
    max_roots: Mutex<usize>,
    slow_threshold_ms: Mutex<u64>,
    observer: Mutex<Option<Arc<dyn SpanObserver>>>,
}

impl PerfTracer {
    pub fn new(max_roots: usize, slow_threshold_ms: u64) -> Self {
        Self {
            state: Mutex::new(TracerState::default()),
            max_roots: Mutex::new(max_roots.max(1)),
            slow_threshold_ms: Mutex::new(slow_threshold_ms),
            observer: Mutex::new(None),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn SpanObserver>) {
        *self.observer.lock() = Some(observer);
    }

    pub fn set_slow_threshold_ms(&self, threshold: u64) {
        *self.slow_threshold_ms.lock() = threshold;
    }

    pub fn set_max_roots(&self, max_roots: usize) {
        *self.max_roots.lock() = max_roots.max(1);
        let mut state = self.state.lock();
        let limit = *self.max_roots.lock();
        while state.roots.len() > limit {
            if let Some(oldest) = state.roots.pop_front() {
                purge_subtree(&mut state.completed, oldest);
            }
        }
    }

    /// Opens a span and returns its id.
    pub fn start(
        &self,
        name: &str,
        parent_id: Option<u64>,
        metadata: Option<Map<String, Value>>,
    ) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.active.insert(
            id,
            SpanRecord {
                id,
                name: SmolStr::new(name),
                parent_id,
                start_ms: epoch_ms(),
                end_ms: None,
                duration_ms: None,
                metadata: metadata.unwrap_or_default(),
                children: Vec::new(),
            },
        );
        id
    }

    /// Closes a span: computes its duration, links it into its parent, and
    /// moves it to the completed map. No-op for unknown ids.
    pub fn end(&self, id: u64, metadata: Option<Map<String, Value>>) {
        let slow = {
            let mut state = self.state.lock();
            let Some(mut span) = state.active.remove(&id) else {
                return;
            };
            let now = epoch_ms();
            span.end_ms = Some(now);
            span.duration_ms = Some(now.saturating_sub(span.start_ms));
            if let Some(extra) = metadata {
                span.metadata.extend(extra);
            }

            let linked = match span.parent_id {
                None => true,
                Some(parent_id) => {
                    // An active parent is preferred; a parent that already
                    // ended still accepts late children.
                    if let Some(parent) = state.active.get_mut(&parent_id) {
                        parent.children.push(id);
                        true
                    } else if let Some(parent) = state.completed.get_mut(&parent_id) {
                        parent.children.push(id);
                        true
                    } else {
                        // Parent was purged; dropping the orphan keeps the
                        // completed map bounded by root history.
                        false
                    }
                }
            };
            if !linked {
                return;
            }

            let duration = span.duration_ms.unwrap_or(0);
            let is_root = span.parent_id.is_none();
            state.completed.insert(id, span);
            if is_root {
                state.roots.push_back(id);
                let limit = *self.max_roots.lock();
                while state.roots.len() > limit {
                    if let Some(oldest) = state.roots.pop_front() {
                        purge_subtree(&mut state.completed, oldest);
                    }
                }
            }

            let threshold = *self.slow_threshold_ms.lock();
            if duration > threshold {
                snapshot_span(&state, id)
            } else {
                None
            }
        };

        if let Some(snapshot) = slow {
            let observer = self.observer.lock().clone();
            if let Some(observer) = observer {
                let _ = catch_unwind(AssertUnwindSafe(|| {
                    observer.on_slow_span(&snapshot);
                }));
            }
        }
    }

    /// Most recent completed roots, newest first.
    pub fn recent(&self, limit: usize) -> Vec<SpanSnapshot> {
        let state = self.state.lock();
        state
            .roots
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| snapshot_span(&state, *id))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.state.lock().completed.len()
    }
}

fn snapshot_span(state: &TracerState, id: u64) -> Option<SpanSnapshot> {
    let record = state.completed.get(&id)?;
    let children = record
        .children
        .iter()
        .filter_map(|child| snapshot_span(state, *child))
        .collect();
    Some(SpanSnapshot {
        id: record.id,
        name: record.name.clone(),
        parent_id: record.parent_id,
        start_ms: record.start_ms,
        end_ms: record.end_ms,
        duration_ms: record.duration_ms,
        metadata: record.metadata.clone(),
        children,
    })
}

fn purge_subtree(completed: &mut FxHashMap<u64, SpanRecord>, id: u64) {
    let Some(record) = completed.remove(&id) else {
        return;
    };
    for child in record.children {
        purge_subtree(completed, child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowCounter(AtomicUsize);

    impl SpanObserver for SlowCounter {
        fn on_slow_span(&self, _span: &SpanSnapshot) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn child_links_into_parent_tree() {
        let tracer = PerfTracer::new(100, u64::MAX);
        let root = tracer.start("analyzeFile", None, None);
        let child = tracer.start("checker.analyze", Some(root), None);
        tracer.end(child, None);
        tracer.end(root, None);

        let recent = tracer.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].name, "analyzeFile");
        assert_eq!(recent[0].children.len(), 1);
        assert_eq!(recent[0].children[0].name, "checker.analyze");
        assert!(recent[0].children[0].start_ms >= recent[0].start_ms);
    }

    #[test]
    fn late_child_attaches_to_completed_parent() {
        let tracer = PerfTracer::new(100, u64::MAX);
        let root = tracer.start("parent", None, None);
        let child = tracer.start("child", Some(root), None);
        // Out-of-order end must not crash; the snapshot still contains both.
        tracer.end(root, None);
        tracer.end(child, None);
        let recent = tracer.recent(1);
        assert_eq!(recent[0].children.len(), 1);
    }

    #[test]
    fn end_is_idempotent_on_unknown_ids() {
        let tracer = PerfTracer::new(100, u64::MAX);
        tracer.end(42, None);
        let root = tracer.start("only", None, None);
        tracer.end(root, None);
        tracer.end(root, None);
        assert_eq!(tracer.recent(10).len(), 1);
    }

    #[test]
    fn root_history_is_bounded_and_purges_subtrees() {
        let tracer = PerfTracer::new(2, u64::MAX);
        for index in 0..4 {
            let root = tracer.start(&format!("root-{index}"), None, None);
            let child = tracer.start("child", Some(root), None);
            tracer.end(child, None);
            tracer.end(root, None);
        }
        let recent = tracer.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].name, "root-3");
        assert_eq!(recent[1].name, "root-2");
        // Two roots with one child each remain in the completed map.
        assert_eq!(tracer.completed_count(), 4);
    }

    #[test]
    fn recent_returns_newest_first() {
        let tracer = PerfTracer::new(10, u64::MAX);
        for name in ["first", "second", "third"] {
            let id = tracer.start(name, None, None);
            tracer.end(id, None);
        }
        let recent = tracer.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].name, "third");
        assert_eq!(recent[1].name, "second");
    }

    #[test]
    fn slow_observer_fires_above_threshold() {
        let tracer = PerfTracer::new(10, 5);
        let counter = Arc::new(SlowCounter(AtomicUsize::new(0)));
        tracer.set_observer(counter.clone());

        let fast = tracer.start("fast", None, None);
        tracer.end(fast, None);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        let slow = tracer.start("slow", None, None);
        std::thread::sleep(std::time::Duration::from_millis(20));
        tracer.end(slow, None);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn end_metadata_merges_into_start_metadata() {
        let tracer = PerfTracer::new(10, u64::MAX);
        let mut start_meta = Map::new();
        start_meta.insert("uri".to_string(), Value::String("file:///a".to_string()));
        let id = tracer.start("span", None, Some(start_meta));
        let mut end_meta = Map::new();
        end_meta.insert("diagnostics".to_string(), Value::from(3));
        tracer.end(id, Some(end_meta));
        let recent = tracer.recent(1);
        assert_eq!(recent[0].metadata.len(), 2);
    }

    #[test]
    fn span_is_active_xor_completed() {
        let tracer = PerfTracer::new(10, u64::MAX);
        let id = tracer.start("span", None, None);
        assert_eq!(tracer.active_count(), 1);
        assert_eq!(tracer.completed_count(), 0);
        tracer.end(id, None);
        assert_eq!(tracer.active_count(), 0);
        assert_eq!(tracer.completed_count(), 1);
    }
}
