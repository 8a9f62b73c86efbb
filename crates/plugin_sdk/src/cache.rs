//! Memoizing, time-boxed cache for per-entity instance contexts.
//!
//! Each key maps to at most one live entry holding a *shared* future, so
//! concurrent lookups for the same entity collapse onto a single build:
//!
//! * a miss (or an expired entry) starts one build and stores its future;
//! * a hit hands out a clone of the stored future, whether it has resolved or
//!   is still in flight;
//! * `force_reload` always starts a new build and replaces the entry, while
//!   callers already holding the old future keep awaiting it;
//! * a failed build removes its own entry, so the next caller starts over.
//!
//! Expiry is `base * (1 + 0.1 * U)` with `U` uniform in `[0, 1)` so keys
//! built together do not all expire together. It is checked lazily on
//! lookup; `spawn_sweeper` only reclaims memory.

use std::{
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use rand::Rng;
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, trace, warn};

/// Fraction of the base TTL added at most as jitter.
pub const JITTER_FACTOR: u32 = 10;

/// Stand-in deadline for lifetimes the clock cannot represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Sweeper period used when the caller asks for zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// A build failure as seen by every caller sharing the build.
#[derive(Error, Debug, Clone)]
#[error("context build for `{key}` failed: {inner}")]
pub struct BuildError {
    pub key: String,
    inner: Arc<anyhow::Error>,
}

impl BuildError {
    pub fn new(key: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            key: key.into(),
            inner: Arc::new(source),
        }
    }

    /// The builder's own error.
    pub fn cause(&self) -> &anyhow::Error {
        &self.inner
    }
}

pub type ContextFuture<T> = Shared<BoxFuture<'static, Result<T, BuildError>>>;

struct CacheEntry<T: Clone> {
    /// Distinguishes this entry from a later replacement under the same key.
    generation: u64,
    pending: ContextFuture<T>,
    expires_at: Instant,
}

impl<T: Clone> CacheEntry<T> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    forced: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    /// Builds started because no live entry existed.
    pub misses: u64,
    /// Builds started by `force_reload`.
    pub forced: u64,
    pub failures: u64,
}

/// Effective lifetime for an entry: uniform in `[base, 1.1 * base)`.
pub fn jittered_ttl(base: Duration) -> Duration {
    let span = base.as_nanos() / u128::from(JITTER_FACTOR);
    if span == 0 {
        return base;
    }
    let span = u64::try_from(span).unwrap_or(u64::MAX);
    let extra = rand::rng().random_range(0..span);
    base.checked_add(Duration::from_nanos(extra))
        .unwrap_or(Duration::MAX)
}

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Typed single-flight cache keyed by entity id.
pub struct EntityContextCache<T: Clone + Send + Sync + 'static> {
    entries: Arc<DashMap<String, CacheEntry<T>>>,
    next_generation: AtomicU64,
    counters: Arc<Counters>,
}

impl<T: Clone + Send + Sync + 'static> Default for EntityContextCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> EntityContextCache<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// The live entry's future, if any. Never builds and never evicts.
    pub fn get(&self, key: &str) -> Option<ContextFuture<T>> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.pending.clone())
    }

    /// Return the live entry for `key`, or start a build with `builder`.
    ///
    /// `builder` is called at most once, and only when no live entry exists
    /// or `force_reload` is set. It runs while the key's shard is locked, so
    /// it must only *create* its future and must not touch this cache.
    pub fn get_or_build<F, Fut>(
        &self,
        key: &str,
        builder: F,
        ttl_base: Duration,
        force_reload: bool,
    ) -> ContextFuture<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !force_reload && occupied.get().is_live(now) {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    trace!(key, "context cache hit");
                    return occupied.get().pending.clone();
                }
                let entry = self.start_build(key, builder(), ttl_base, now, force_reload);
                let pending = entry.pending.clone();
                occupied.insert(entry);
                pending
            }
            Entry::Vacant(vacant) => {
                let entry = self.start_build(key, builder(), ttl_base, now, force_reload);
                let pending = entry.pending.clone();
                vacant.insert(entry);
                pending
            }
        }
    }

    fn start_build<Fut>(
        &self,
        key: &str,
        build: Fut,
        ttl_base: Duration,
        now: Instant,
        forced: bool,
    ) -> CacheEntry<T>
    where
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let counter = if forced { &self.counters.forced } else { &self.counters.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(key, generation, forced, "building instance context");

        // Weak, so the stored future does not keep its own map alive.
        let entries: Weak<DashMap<String, CacheEntry<T>>> = Arc::downgrade(&self.entries);
        let counters = Arc::clone(&self.counters);
        let owned_key = key.to_string();

        let pending = async move {
            match build.await {
                Ok(value) => Ok(value),
                Err(err) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %owned_key, generation, error = %err, "instance context build failed");
                    if let Some(entries) = entries.upgrade() {
                        // only our own entry; a forced rebuild may have replaced it
                        entries.remove_if(&owned_key, |_, entry| entry.generation == generation);
                    }
                    Err(BuildError::new(owned_key, err))
                }
            }
        }
        .boxed()
        .shared();

        CacheEntry {
            generation,
            pending,
            expires_at: deadline(now, jittered_ttl(ttl_base)),
        }
    }

    /// Drop the entry for `key`. Callers already awaiting it are unaffected.
    pub fn purge(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            forced: self.counters.forced.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically reclaim expired entries. The task stops once the cache
    /// is dropped. A zero `interval` is clamped to one millisecond.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let entries = Arc::downgrade(&self.entries);
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(entries) = entries.upgrade() else { break };
                let now = Instant::now();
                entries.retain(|_, entry| entry.is_live(now));
            }
        })
    }
}
