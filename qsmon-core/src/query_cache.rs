//! LRU cache of materialized query results with TTL and group-scoped
//! invalidation.
//!
//! Keys are canonical serializations of normalized queries, so logically
//! equal queries share an entry. A reverse index from group to keys makes
//! ingest-time invalidation proportional to the group's entries rather
//! than the whole cache. Queries without a group scope are indexed under a
//! wildcard bucket and fall on any ingest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use qsmon_model::CachedEvent;
use serde::Serialize;

/// Scope of groups a cached result drew from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupScope {
    Group(String),
    AllGroups,
}

#[derive(Debug)]
struct CacheEntry {
    result: Arc<Vec<CachedEvent>>,
    stored_at: Instant,
    scope: GroupScope,
    last_used: u64,
}

/// Hit/miss counters for statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
pub struct QueryCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
    scope_keys: HashMap<GroupScope, HashSet<String>>,
    use_counter: u64,
    hits: u64,
    misses: u64,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            scope_keys: HashMap::new(),
            use_counter: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a result, refreshing its recency. Expired entries are
    /// removed on contact.
    pub fn get(&mut self, key: &str) -> Option<Arc<Vec<CachedEvent>>> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.stored_at.elapsed() > self.ttl,
            None => {
                self.misses += 1;
                return None;
            }
        };
        if expired {
            self.remove(key);
            self.misses += 1;
            return None;
        }

        self.use_counter += 1;
        let entry = self.entries.get_mut(key).expect("checked above");
        entry.last_used = self.use_counter;
        self.hits += 1;
        Some(Arc::clone(&entry.result))
    }

    /// Store a result under its canonical key. `group_id` is the query's
    /// scope; `None` means the result may draw from any group.
    pub fn put(
        &mut self,
        key: String,
        group_id: Option<&str>,
        result: Arc<Vec<CachedEvent>>,
    ) {
        let scope = match group_id {
            Some(g) => GroupScope::Group(g.to_string()),
            None => GroupScope::AllGroups,
        };

        self.remove(&key);
        while self.entries.len() >= self.capacity {
            self.evict_lru();
        }

        self.use_counter += 1;
        self.scope_keys
            .entry(scope.clone())
            .or_default()
            .insert(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: Instant::now(),
                scope,
                last_used: self.use_counter,
            },
        );
    }

    /// Drop every entry that could reference `group_id`: its own bucket
    /// plus the wildcard bucket.
    pub fn invalidate_group(&mut self, group_id: &str) {
        self.invalidate_scope(&GroupScope::Group(group_id.to_string()));
        self.invalidate_scope(&GroupScope::AllGroups);
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
        self.scope_keys.clear();
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }

    fn invalidate_scope(&mut self, scope: &GroupScope) {
        if let Some(keys) = self.scope_keys.remove(scope) {
            for key in keys {
                self.entries.remove(&key);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key)
            && let Some(keys) = self.scope_keys.get_mut(&entry.scope)
        {
            keys.remove(key);
            if keys.is_empty() {
                self.scope_keys.remove(&entry.scope);
            }
        }
    }

    fn evict_lru(&mut self) {
        let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())
        else {
            return;
        };
        self.remove(&key);
    }
}
