//! Type-info cache layered with a file dependency graph.
//!
//! Edges record imports per analyzed file; invalidation walks the reverse
//! edges so dependents of a changed file drop their cached entries too.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use smol_str::SmolStr;
use std::collections::VecDeque;

use crate::cache::{CacheStats, ResultCache};

/// Result cache plus a mirrored dependency graph.
///
/// Invariant: `b ∈ depends_on[a]` iff `a ∈ depended_on_by[b]`.
#[derive(Debug)]
pub struct TypeCache<T> {
    cache: ResultCache<T>,
    depends_on: FxHashMap<SmolStr, FxHashSet<SmolStr>>,
    depended_on_by: FxHashMap<SmolStr, FxHashSet<SmolStr>>,
}

impl<T: Serialize + Clone> TypeCache<T> {
    pub fn new(max_entries: usize, max_bytes: u64, ttl_ms: u64) -> Self {
        Self {
            cache: ResultCache::new(max_entries, max_bytes, ttl_ms),
            depends_on: FxHashMap::default(),
            depended_on_by: FxHashMap::default(),
        }
    }

    pub fn configure(&mut self, max_entries: usize, max_bytes: u64, ttl_ms: u64) {
        self.cache.configure(max_entries, max_bytes, ttl_ms);
    }

    pub fn get(&mut self, uri: &str, hash: u128) -> Option<T> {
        self.cache.get(uri, hash)
    }

    pub fn set(&mut self, uri: &str, hash: u128, value: T) {
        self.cache.set(uri, hash, value);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Records `from` importing `to`. Idempotent; mirrors the reverse edge.
    pub fn add_dependency(&mut self, from: &str, to: &str) {
        self.depends_on
            .entry(SmolStr::new(from))
            .or_default()
            .insert(SmolStr::new(to));
        self.depended_on_by
            .entry(SmolStr::new(to))
            .or_default()
            .insert(SmolStr::new(from));
    }

    /// Drops all outgoing edges of `from` and their mirrored reverses.
    ///
    /// Called before re-analysis, when a file's import set may have changed.
    pub fn clear_dependencies(&mut self, from: &str) {
        let Some(targets) = self.depends_on.remove(from) else {
            return;
        };
        for target in targets {
            if let Some(reverse) = self.depended_on_by.get_mut(&target) {
                reverse.remove(from);
                if reverse.is_empty() {
                    self.depended_on_by.remove(&target);
                }
            }
        }
    }

    pub fn dependencies_of(&self, uri: &str) -> Vec<SmolStr> {
        self.depends_on
            .get(uri)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, uri: &str) -> Vec<SmolStr> {
        self.depended_on_by
            .get(uri)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Breadth-first walk of the reverse edges from `uri`, dropping the cache
    /// entry of every visited file. Returns the closure including `uri`.
    pub fn invalidate_cascade(&mut self, uri: &str) -> FxHashSet<SmolStr> {
        let mut visited: FxHashSet<SmolStr> = FxHashSet::default();
        let mut frontier: VecDeque<SmolStr> = VecDeque::new();
        let origin = SmolStr::new(uri);
        visited.insert(origin.clone());
        frontier.push_back(origin);
        while let Some(current) = frontier.pop_front() {
            self.cache.invalidate(&current);
            if let Some(dependents) = self.depended_on_by.get(&current) {
                for dependent in dependents {
                    if visited.insert(dependent.clone()) {
                        frontier.push_back(dependent.clone());
                    }
                }
            }
        }
        visited
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.depends_on.clear();
        self.depended_on_by.clear();
    }

    #[cfg(test)]
    fn duality_holds(&self) -> bool {
        let forward_ok = self.depends_on.iter().all(|(from, targets)| {
            targets.iter().all(|to| {
                self.depended_on_by
                    .get(to)
                    .is_some_and(|reverse| reverse.contains(from))
            })
        });
        let reverse_ok = self.depended_on_by.iter().all(|(to, sources)| {
            sources.iter().all(|from| {
                self.depends_on
                    .get(from)
                    .is_some_and(|forward| forward.contains(to))
            })
        });
        forward_ok && reverse_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;

    fn populated() -> TypeCache<String> {
        let mut cache = TypeCache::new(64, 1024 * 1024, 60_000);
        cache.add_dependency("a", "lib");
        cache.add_dependency("b", "lib");
        for uri in ["a", "b", "lib"] {
            cache.set(uri, content_hash(uri.as_bytes()), format!("types:{uri}"));
        }
        cache
    }

    #[test]
    fn edges_stay_mirrored() {
        let mut cache = populated();
        assert!(cache.duality_holds());
        cache.add_dependency("a", "lib");
        assert_eq!(cache.dependencies_of("a").len(), 1);
        cache.clear_dependencies("a");
        assert!(cache.dependencies_of("a").is_empty());
        assert!(!cache.dependents_of("lib").contains(&SmolStr::new("a")));
        assert!(cache.duality_holds());
    }

    #[test]
    fn cascade_returns_reverse_closure_and_drops_entries() {
        let mut cache = populated();
        let invalidated = cache.invalidate_cascade("lib");
        let expected: FxHashSet<SmolStr> =
            ["lib", "a", "b"].into_iter().map(SmolStr::new).collect();
        assert_eq!(invalidated, expected);
        for uri in ["a", "b", "lib"] {
            assert!(cache.get(uri, content_hash(uri.as_bytes())).is_none());
        }
    }

    #[test]
    fn cascade_only_walks_reverse_edges() {
        let mut cache = populated();
        let invalidated = cache.invalidate_cascade("a");
        assert_eq!(invalidated.len(), 1);
        assert!(cache
            .get("lib", content_hash(b"lib"))
            .is_some());
    }

    #[test]
    fn cascade_terminates_on_cycles() {
        let mut cache = TypeCache::new(16, 1024, 60_000);
        cache.add_dependency("a", "b");
        cache.add_dependency("b", "a");
        cache.set("a", 1, "ta".to_string());
        cache.set("b", 2, "tb".to_string());
        let invalidated = cache.invalidate_cascade("a");
        assert_eq!(invalidated.len(), 2);
    }
}
