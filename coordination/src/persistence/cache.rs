//! Result cache for deduplicating identical supervisor assessments.
//!
//! An in-memory LRU-ish cache with a TTL; it does not persist across
//! restarts (persistence owns the on-disk session/checkpoint state, not
//! this cache).

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct ResultCache<V> {
    entries: HashMap<String, Entry<V>>,
    insertion_order: Vec<String>,
    max_size: usize,
    ttl: Duration,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: Vec::new(),
            max_size,
            ttl,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.inserted_at.elapsed() >= self.ttl)
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
            self.insertion_order.retain(|k| k != key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn put(&mut self, key: String, value: V) {
        if !self.entries.contains_key(&key) {
            self.insertion_order.push(key.clone());
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        while self.insertion_order.len() > self.max_size {
            let oldest = self.insertion_order.remove(0);
            self.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hashes `(response, goal, consecutive_issues)` into the cache key used to
/// dedupe CONTINUE assessments.
pub fn assessment_cache_key(response: &str, goal: &str, consecutive_issues: u32) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    response.hash(&mut hasher);
    goal.hash(&mut hasher);
    consecutive_issues.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
