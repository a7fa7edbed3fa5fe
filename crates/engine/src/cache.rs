//! Best-effort in-process cache of instance states.
//!
//! The cache is never authoritative: a miss or an eviction only costs a
//! reload from the journal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use event_store::InstanceKey;
use tokio::sync::RwLock;

use crate::aggregate::Aggregate;
use crate::state::AggregateInstanceState;

/// Keyed store of instance states.
///
/// `put` overwrites unconditionally.
#[async_trait]
pub trait AggregateCache<A: Aggregate>: Send + Sync {
    async fn get(&self, key: &InstanceKey) -> Option<AggregateInstanceState<A>>;

    async fn put(&self, state: AggregateInstanceState<A>);
}

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}

/// LRU cache with a time-to-live per entry.
pub struct InMemoryAggregateCache<A: Aggregate> {
    max_entries: usize,
    ttl: Duration,
    entries: RwLock<HashMap<InstanceKey, CacheEntry<AggregateInstanceState<A>>>>,
    stats: CacheStats,
}

impl<A: Aggregate> InMemoryAggregateCache<A> {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops one instance, forcing the next fetch to reload it.
    pub async fn invalidate(&self, key: &InstanceKey) {
        self.entries.write().await.remove(key);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn evict_oldest(&self, entries: &mut HashMap<InstanceKey, CacheEntry<AggregateInstanceState<A>>>) {
        if let Some(oldest_key) = entries
            .iter()
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(k, _)| k.clone())
        {
            entries.remove(&oldest_key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl<A: Aggregate> AggregateCache<A> for InMemoryAggregateCache<A> {
    async fn get(&self, key: &InstanceKey) -> Option<AggregateInstanceState<A>> {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get_mut(key) {
            if entry.created_at.elapsed() > self.ttl {
                entries.remove(key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            entry.last_accessed = Instant::now();
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn put(&self, state: AggregateInstanceState<A>) {
        let mut entries = self.entries.write().await;
        let key = state.key().clone();

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            self.evict_oldest(&mut entries);
        }

        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                value: state,
                created_at: now,
                last_accessed: now,
            },
        );
    }
}
