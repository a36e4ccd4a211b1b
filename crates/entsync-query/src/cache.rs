//! Shared query result cache.
//!
//! The only state shared between transactions. Entries hold identifiers, not
//! instances: a hit is turned back into instances by loading the identifiers
//! through the caller's fetch plan. Every entry records the entity types that
//! contributed to it, and a commit touching any of those types drops it.
//!
//! Entries live in shards behind `parking_lot::RwLock`s, picked by the hash
//! of the key. Lookups take a read lock on one shard; invalidation by type
//! scans every shard and may drop more than strictly necessary.
//!
//! Invalidation also stamps each type with a value of the process-wide
//! sequence. A result whose reader started before that stamp is refused by
//! [`QueryResultCache::put`], so a stale read cannot outlive the commit that
//! invalidated it.

use entsync_core::{Error, Result, Value};
use entsync_session::{TypeInvalidation, next_sequence};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_SHARDS: usize = 16;

/// Canonical cache key: a JSON rendering of everything a result depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryCacheKey(String);

impl QueryCacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueryCacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inputs of a [`QueryCacheKey`].
#[derive(Debug, Clone, Default)]
pub struct CacheKeyParts<'a> {
    pub query: &'a str,
    pub parameters: &'a [(String, Value)],
    pub soft_deletion: bool,
    pub single: bool,
    pub security_parameters: Option<&'a BTreeMap<String, Value>>,
    /// Fingerprint of the merged fetch plan.
    pub plan: Option<String>,
    pub first: usize,
    pub max: Option<usize>,
}

#[derive(Serialize)]
struct CanonicalKey<'a> {
    query: String,
    parameters: BTreeMap<&'a str, &'a Value>,
    soft_deletion: bool,
    single: bool,
    security: BTreeMap<&'a str, &'a Value>,
    plan: Option<&'a str>,
    first: usize,
    max: Option<usize>,
}

impl CacheKeyParts<'_> {
    pub fn key(&self) -> Result<QueryCacheKey> {
        let canonical = CanonicalKey {
            query: normalize_query(self.query),
            parameters: self.parameters.iter().map(|(k, v)| (k.as_str(), v)).collect(),
            soft_deletion: self.soft_deletion,
            single: self.single,
            security: self
                .security_parameters
                .map(|m| m.iter().map(|(k, v)| (k.as_str(), v)).collect())
                .unwrap_or_default(),
            plan: self.plan.as_deref(),
            first: self.first,
            max: self.max,
        };
        serde_json::to_string(&canonical)
            .map(QueryCacheKey)
            .map_err(|e| Error::Custom(format!("cannot render cache key: {e}")))
    }
}

/// Collapse whitespace runs outside string literals so formatting
/// differences share an entry. Quoted text is kept verbatim.
pub fn normalize_query(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for c in query.chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

/// Outcome recorded for a query.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedResult {
    /// Primary keys of the result, in result order.
    Ids(Vec<Vec<Value>>),
    NoResult,
    /// A single-result load matched this many rows.
    NonUnique(usize),
}

#[derive(Debug)]
struct CacheEntry {
    result: CachedResult,
    types: BTreeSet<String>,
    last_used: AtomicU64,
    hit_count: AtomicU64,
}

/// Counters reported by [`QueryResultCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidated: u64,
}

/// Sharded result cache with least-recently-used eviction per shard.
pub struct QueryResultCache {
    shards: Vec<RwLock<HashMap<QueryCacheKey, CacheEntry>>>,
    shard_capacity: usize,
    /// Sequence value of the latest invalidation per entity type.
    generations: RwLock<HashMap<String, u64>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidated: AtomicU64,
}

impl QueryResultCache {
    /// Create a cache holding about `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self::with_shards(capacity, DEFAULT_SHARDS)
    }

    pub fn with_shards(capacity: usize, shards: usize) -> Self {
        let shards = shards.clamp(1, capacity.max(1));
        Self {
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            shard_capacity: capacity.div_ceil(shards).max(1),
            generations: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &QueryCacheKey) -> &RwLock<HashMap<QueryCacheKey, CacheEntry>> {
        let index = (shard_hash(key) % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, key: &QueryCacheKey) -> Option<CachedResult> {
        let shard = self.shard(key).read();
        match shard.get(key) {
            Some(entry) => {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                entry.hit_count.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.result.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, key: &QueryCacheKey) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Store `result` under `key`, tagged with the entity types it depends on.
    ///
    /// `since` is the sequence value taken when the reader started. The result
    /// is refused if any of `types` was invalidated after that point. Returns
    /// whether the entry was stored.
    pub fn put(
        &self,
        key: QueryCacheKey,
        result: CachedResult,
        types: BTreeSet<String>,
        since: u64,
    ) -> bool {
        let mut shard = self.shard(&key).write();
        if let Some(stale) = self.invalidated_since(&types, since) {
            tracing::trace!(key = %key, entity = %stale, since, "Refusing stale query result");
            return false;
        }
        if !shard.contains_key(&key) && shard.len() >= self.shard_capacity {
            evict_lru(&mut shard);
        }
        tracing::trace!(key = %key, types = ?types, "Caching query result");
        shard.insert(
            key,
            CacheEntry {
                result,
                types,
                last_used: AtomicU64::new(self.tick()),
                hit_count: AtomicU64::new(0),
            },
        );
        true
    }

    fn invalidated_since<'a>(&self, types: &'a BTreeSet<String>, since: u64) -> Option<&'a str> {
        let generations = self.generations.read();
        types
            .iter()
            .find(|t| generations.get(t.as_str()).is_some_and(|g| *g > since))
            .map(String::as_str)
    }

    /// Drop every entry depending on any of `types`. Returns how many went.
    pub fn invalidate(&self, types: &BTreeSet<String>) -> usize {
        {
            // Stamped before the scan: a put racing with it sees the stamp
            // once it holds its shard lock.
            let stamp = next_sequence();
            let mut generations = self.generations.write();
            for t in types {
                generations.insert(t.clone(), stamp);
            }
        }
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.write();
            let before = shard.len();
            shard.retain(|_, entry| entry.types.is_disjoint(types));
            removed += before - shard.len();
        }
        self.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            tracing::debug!(types = ?types, removed, "Invalidated cached query results");
        }
        removed
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
        }
    }
}

impl Default for QueryResultCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl TypeInvalidation for QueryResultCache {
    fn invalidate_types(&self, entity_names: &BTreeSet<String>) {
        self.invalidate(entity_names);
    }
}

impl std::fmt::Debug for QueryResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResultCache")
            .field("shards", &self.shards.len())
            .field("shard_capacity", &self.shard_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

fn evict_lru(shard: &mut HashMap<QueryCacheKey, CacheEntry>) {
    let lru = shard
        .iter()
        .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
        .map(|(key, _)| key.clone());
    if let Some(key) = lru {
        tracing::trace!(key = %key, "Evicting cached query result");
        shard.remove(&key);
    }
}

fn shard_hash(key: &QueryCacheKey) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
