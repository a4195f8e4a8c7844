use crate::config::CacheConfig;
use crate::models::{ChartSeriesData, ProcessingConfig};
use lru::LruCache;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// Coût estimé d'un point : horodatage i64 + valeur f64.
const BYTES_PER_POINT: usize = 16;

/// Cache key derived from every semantic input of a query.
///
/// Tags are sorted and deduplicated, and the processing config is normalized before
/// serialization, so requests that only differ in tag order or in the parameters of a
/// disabled stage share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueryFingerprint {
    pub profile: String,
    pub table: String,
    pub start_time: String,
    pub end_time: String,
    pub tags: Vec<String>,
    pub processing: String,
}

impl QueryFingerprint {
    pub fn new(
        profile: &str,
        table: &str,
        start_time: &str,
        end_time: &str,
        tags: &[String],
        processing: &ProcessingConfig,
    ) -> Self {
        let mut tags: Vec<String> = tags.iter().map(|t| t.trim().to_string()).collect();
        tags.sort();
        tags.dedup();

        // La sérialisation d'une structure sans clé dynamique ne peut pas échouer.
        let processing = serde_json::to_string(&processing.normalized()).unwrap_or_default();

        Self {
            profile: profile.to_string(),
            table: table.to_string(),
            start_time: start_time.to_string(),
            end_time: end_time.to_string(),
            tags,
            processing,
        }
    }

    /// Short hexadecimal digest, for logs.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.digest())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: QueryFingerprint,
    pub series: Vec<ChartSeriesData>,
    pub total_raw: usize,
    pub total_processed: usize,
    pub created_at: Instant,
    pub estimated_size_bytes: usize,
}

impl CacheEntry {
    pub fn new(
        fingerprint: QueryFingerprint,
        series: Vec<ChartSeriesData>,
        total_raw: usize,
        total_processed: usize,
    ) -> Self {
        let estimated_size_bytes = estimate_size(&series);
        Self {
            fingerprint,
            series,
            total_raw,
            total_processed,
            created_at: Instant::now(),
            estimated_size_bytes,
        }
    }

    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.created_at.elapsed() >= ttl)
    }
}

/// Per-point cost times the total point count across every series.
pub fn estimate_size(series: &[ChartSeriesData]) -> usize {
    series.iter().map(|s| s.points.len()).sum::<usize>() * BYTES_PER_POINT
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entry_count: usize,
    pub max_entries: usize,
    pub estimated_memory_bytes: usize,
}

struct CacheInner {
    entries: LruCache<QueryFingerprint, Arc<CacheEntry>>,
    hits: u64,
    misses: u64,
    memory_bytes: usize,
}

impl CacheInner {
    fn remove(&mut self, fingerprint: &QueryFingerprint) {
        if let Some(entry) = self.entries.pop(fingerprint) {
            self.memory_bytes = self.memory_bytes.saturating_sub(entry.estimated_size_bytes);
        }
    }
}

/// Fingerprint-keyed LRU store of processed query results.
///
/// One mutex guards the LRU order, the entries and the counters. A poisoned lock turns
/// every lookup into a miss and every write into a no-op instead of failing the request.
pub struct QueryCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    ttl: Option<Duration>,
}

impl QueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                memory_bytes: 0,
            }),
            max_entries: capacity.get(),
            ttl: config.ttl(),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, CacheInner>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("Query cache lock poisoned, bypassing cache");
                None
            }
        }
    }

    /// Looks up `fingerprint`, counting a hit or a miss. Expired entries count as misses
    /// and are dropped on the spot.
    pub fn get(&self, fingerprint: &QueryFingerprint) -> Option<Arc<CacheEntry>> {
        let mut inner = self.lock()?;

        let expired = match inner.entries.get(fingerprint) {
            Some(entry) if !entry.is_expired(self.ttl) => {
                let entry = Arc::clone(entry);
                inner.hits += 1;
                debug!(fingerprint = %fingerprint, "Cache hit");
                return Some(entry);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            debug!(fingerprint = %fingerprint, "Cache entry expired");
            inner.remove(fingerprint);
        }
        inner.misses += 1;
        None
    }

    /// Inserts or replaces the entry under its fingerprint, evicting least recently used
    /// entries beyond capacity.
    pub fn put(&self, entry: CacheEntry) {
        let Some(mut inner) = self.lock() else {
            return;
        };

        let fingerprint = entry.fingerprint.clone();
        let size = entry.estimated_size_bytes;
        inner.remove(&fingerprint);

        // `push` renvoie l'entrée la moins récemment utilisée quand la capacité est atteinte.
        if let Some((evicted_key, evicted)) = inner.entries.push(fingerprint, Arc::new(entry)) {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(evicted.estimated_size_bytes);
            debug!(fingerprint = %evicted_key, "Evicted least recently used cache entry");
        }
        inner.memory_bytes += size;
    }

    /// Presence check that leaves counters and LRU order untouched.
    pub fn contains(&self, fingerprint: &QueryFingerprint) -> bool {
        let Some(inner) = self.lock() else {
            return false;
        };
        let present = inner
            .entries
            .peek(fingerprint)
            .is_some_and(|entry| !entry.is_expired(self.ttl));
        present
    }

    /// Drops every entry and resets the hit and miss counters.
    pub fn clear(&self) {
        if let Some(mut inner) = self.lock() {
            let dropped = inner.entries.len();
            inner.entries.clear();
            inner.hits = 0;
            inner.misses = 0;
            inner.memory_bytes = 0;
            info!(entries = dropped, "Query cache cleared");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let Some(inner) = self.lock() else {
            return CacheStats {
                hits: 0,
                misses: 0,
                hit_rate: 0.0,
                entry_count: 0,
                max_entries: self.max_entries,
                estimated_memory_bytes: 0,
            };
        };

        let lookups = inner.hits + inner.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / lookups as f64
        };

        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            hit_rate,
            entry_count: inner.entries.len(),
            max_entries: self.max_entries,
            estimated_memory_bytes: inner.memory_bytes,
        }
    }

    /// Removes entries older than the TTL and returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let Some(mut inner) = self.lock() else {
            return 0;
        };

        let expired: Vec<QueryFingerprint> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(Some(ttl)))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    /// Spawns the periodic TTL sweep. Returns `None` when entries never expire.
    pub fn spawn_cleanup(cache: Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        cache.ttl?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = cache.evict_expired();
                if evicted > 0 {
                    info!(evicted, "Expired query cache entries removed");
                }
            }
        }))
    }
}
