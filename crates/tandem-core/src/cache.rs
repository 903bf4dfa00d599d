//! Content-hash keyed LRU cache with TTL and byte accounting.

use rustc_hash::FxHashMap;
use serde::Serialize;
use smol_str::SmolStr;

use crate::epoch_ms;

/// Aggregate cache counters for the inspector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    content_hash: u128,
    created_at_ms: u64,
    last_accessed_ms: u64,
    /// Monotonic tiebreak when two entries share a millisecond.
    touched: u64,
    hits: u64,
    size_bytes: u64,
}

/// In-memory cache keyed by uri, guarded externally (one mutex per cache).
///
/// `get` misses on a stale hash or an expired TTL and deletes the entry in
/// both cases. Insertion evicts least-recently-accessed entries until the
/// entry-count and byte bounds hold again.
#[derive(Debug)]
pub struct ResultCache<T> {
    entries: FxHashMap<SmolStr, CacheEntry<T>>,
    total_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    max_entries: usize,
    max_bytes: u64,
    ttl_ms: u64,
    touch_counter: u64,
}

impl<T: Serialize + Clone> ResultCache<T> {
    pub fn new(max_entries: usize, max_bytes: u64, ttl_ms: u64) -> Self {
        Self {
            entries: FxHashMap::default(),
            total_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            max_entries,
            max_bytes,
            ttl_ms,
            touch_counter: 0,
        }
    }

    /// Applies new bounds and evicts down to them immediately.
    pub fn configure(&mut self, max_entries: usize, max_bytes: u64, ttl_ms: u64) {
        self.max_entries = max_entries;
        self.max_bytes = max_bytes;
        self.ttl_ms = ttl_ms;
        self.evict_to_bounds();
    }

    pub fn get(&mut self, uri: &str, hash: u128) -> Option<T> {
        let now = epoch_ms();
        let expired = match self.entries.get(uri) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => {
                // TTL of zero means "never valid".
                entry.content_hash != hash
                    || self.ttl_ms == 0
                    || now.saturating_sub(entry.created_at_ms) > self.ttl_ms
            }
        };
        if expired {
            self.remove_entry(uri);
            self.misses += 1;
            return None;
        }
        self.touch_counter += 1;
        let touched = self.touch_counter;
        let entry = self.entries.get_mut(uri)?;
        entry.last_accessed_ms = now;
        entry.touched = touched;
        entry.hits += 1;
        self.hits += 1;
        Some(entry.value.clone())
    }

    /// Replaces any prior entry for the uri and evicts to bounds.
    pub fn set(&mut self, uri: &str, hash: u128, value: T) {
        self.remove_entry(uri);
        let now = epoch_ms();
        let size_bytes = estimate_size(uri, &value);
        self.touch_counter += 1;
        self.entries.insert(
            SmolStr::new(uri),
            CacheEntry {
                value,
                content_hash: hash,
                created_at_ms: now,
                last_accessed_ms: now,
                touched: self.touch_counter,
                hits: 0,
                size_bytes,
            },
        );
        self.total_bytes += size_bytes;
        self.evict_to_bounds();
    }

    pub fn invalidate(&mut self, uri: &str) -> bool {
        self.remove_entry(uri)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        let (hit_rate, miss_rate) = if lookups == 0 {
            (0.0, 0.0)
        } else {
            (
                self.hits as f64 / lookups as f64,
                self.misses as f64 / lookups as f64,
            )
        };
        CacheStats {
            entries: self.entries.len(),
            total_bytes: self.total_bytes,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            hit_rate,
            miss_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_entry(&mut self, uri: &str) -> bool {
        match self.entries.remove(uri) {
            Some(entry) => {
                self.total_bytes -= entry.size_bytes;
                true
            }
            None => false,
        }
    }

    fn evict_to_bounds(&mut self) {
        while self.entries.len() > self.max_entries || self.total_bytes > self.max_bytes {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.last_accessed_ms, entry.touched))
                .map(|(uri, _)| uri.clone());
            let Some(uri) = victim else {
                break;
            };
            self.remove_entry(&uri);
            self.evictions += 1;
        }
    }
}

/// Deterministic serialized-length size estimate, honored on removal.
fn estimate_size<T: Serialize>(uri: &str, value: &T) -> u64 {
    let body = serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0);
    (uri.len() + body) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;

    fn cache() -> ResultCache<Vec<String>> {
        ResultCache::new(16, 1024 * 1024, 60_000)
    }

    #[test]
    fn hit_requires_matching_hash() {
        let mut cache = cache();
        let hash = content_hash(b"v1");
        cache.set("file:///a", hash, vec!["d".to_string()]);
        assert!(cache.get("file:///a", hash).is_some());
        assert!(cache.get("file:///a", content_hash(b"v2")).is_none());
        // The stale entry was deleted on the mismatched get.
        assert!(cache.is_empty());
    }

    #[test]
    fn byte_sum_matches_stats_total() {
        let mut cache = cache();
        cache.set("a", 1, vec!["x".repeat(10)]);
        cache.set("b", 2, vec!["y".repeat(50)]);
        let expected = estimate_size("a", &vec!["x".repeat(10)])
            + estimate_size("b", &vec!["y".repeat(50)]);
        assert_eq!(cache.stats().total_bytes, expected);
        cache.invalidate("a");
        assert_eq!(
            cache.stats().total_bytes,
            estimate_size("b", &vec!["y".repeat(50)])
        );
    }

    #[test]
    fn single_entry_bound_evicts_the_older_insert() {
        let mut cache: ResultCache<Vec<String>> = ResultCache::new(1, 1024 * 1024, 60_000);
        cache.set("a", 1, vec!["first".to_string()]);
        cache.set("b", 2, vec!["second".to_string()]);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("b", 2).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn byte_bound_evicts_least_recently_accessed() {
        let small = estimate_size("a", &vec!["x".repeat(64)]);
        let mut cache: ResultCache<Vec<String>> = ResultCache::new(16, small * 2 + 8, 60_000);
        cache.set("a", 1, vec!["x".repeat(64)]);
        cache.set("b", 2, vec!["x".repeat(64)]);
        // Refresh "a" so "b" becomes the LRU victim.
        assert!(cache.get("a", 1).is_some());
        cache.set("c", 3, vec!["x".repeat(64)]);
        assert!(cache.get("a", 1).is_some());
        assert!(cache.get("b", 2).is_none());
        assert!(cache.get("c", 3).is_some());
    }

    #[test]
    fn zero_ttl_is_never_valid() {
        let mut cache: ResultCache<Vec<String>> = ResultCache::new(16, 1024, 0);
        cache.set("a", 1, vec!["v".to_string()]);
        assert!(cache.get("a", 1).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn clear_resets_every_counter() {
        let mut cache = cache();
        cache.set("a", 1, vec!["v".to_string()]);
        let _ = cache.get("a", 1);
        let _ = cache.get("a", 9);
        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn empty_content_round_trips() {
        let mut cache = cache();
        let hash = content_hash(b"");
        cache.set("file:///empty", hash, Vec::new());
        let value = cache.get("file:///empty", hash);
        assert_eq!(value, Some(Vec::new()));
    }
}
