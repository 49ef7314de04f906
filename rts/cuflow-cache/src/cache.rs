//! The decaying cache.

use crate::bin::{Bin, Pass};
use crate::config::{CacheConf, Sweep};
use crate::error::{CacheError, CacheResult};
use crate::object::{Built, CacheObject};
use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Builds the value for a key on a miss.
pub type Constructor<K, V> = Arc<dyn Fn(&K) -> Built<V> + Send + Sync>;

/// Statistics for a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the table.
    pub hits: u64,
    /// Lookups that ran a constructor.
    pub misses: u64,
    /// Objects dropped by maintenance.
    pub evictions: u64,
    /// Maintenance passes over a bin.
    pub passes: u64,
    /// Bin capacity doublings.
    pub grows: u64,
    /// Bin capacity halvings.
    pub shrinks: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    passes: AtomicU64,
    grows: AtomicU64,
    shrinks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            grows: self.grows.load(Ordering::Relaxed),
            shrinks: self.shrinks.load(Ordering::Relaxed),
        }
    }
}

struct CacheInner<K, V> {
    conf: CacheConf,
    bins: Box<[CachePadded<Mutex<Bin<K, V>>>]>,
    ctors: RwLock<FxHashMap<&'static str, Constructor<K, V>>>,
    counters: Counters,
}

/// A memo table keyed by `(function code, key)` whose entries decay.
///
/// Each hit decays the object's score by the ticks elapsed since its last
/// touch, then adds its gain. Once a bin has seen as many accesses as it
/// has chains, a maintenance pass evicts objects whose decayed score per
/// byte of cost is below the configured threshold and resizes the bin.
///
/// Cloning yields another handle to the same table.
pub struct Cache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create an empty cache ticking by `conf`'s clock.
    #[must_use]
    pub fn new(conf: &CacheConf) -> Self {
        let config = conf.config();
        let bins = (0..config.bins)
            .map(|_| CachePadded::new(Mutex::new(Bin::new(config.min_capacity))))
            .collect();
        let inner = Arc::new(CacheInner {
            conf: conf.clone(),
            bins,
            ctors: RwLock::new(FxHashMap::default()),
            counters: Counters::default(),
        });
        let sweep: Weak<dyn Sweep> = Arc::downgrade(&inner) as Weak<CacheInner<K, V>>;
        conf.register(sweep);
        Self { inner }
    }

    /// Register the constructor run on a miss for `code`, replacing any
    /// previous one.
    pub fn register(&self, code: &'static str, ctor: impl Fn(&K) -> Built<V> + Send + Sync + 'static) {
        self.inner.ctors.write().insert(code, Arc::new(ctor));
    }

    /// Look up `(code, key)`, building and publishing the object on a miss.
    ///
    /// The constructor runs without any bin lock held. If another thread
    /// published the same key meanwhile, its object wins and the fresh one
    /// is discarded.
    pub fn call(&self, code: &'static str, key: &K) -> CacheResult<Arc<CacheObject<K, V>>> {
        let inner = &*self.inner;
        let hash = hash_of(code, key);
        let bin = inner.bin(hash);

        if let Some(hit) = inner.touch_existing(bin, hash, code, key) {
            return Ok(hit);
        }

        let ctor = inner
            .ctors
            .read()
            .get(code)
            .cloned()
            .ok_or(CacheError::UnknownCode { code })?;
        let built = (ctor.as_ref())(key);

        let mut guard = bin.lock();
        let now = inner.conf.now();
        if let Some(raced) = guard.find(hash, code, key).cloned() {
            raced.touch(now);
            inner.after_access(&mut guard, now);
            drop(guard);
            Counters::bump(&inner.counters.hits, 1);
            return Ok(raced);
        }
        let fresh = Arc::new(CacheObject::new(code, key.clone(), hash, built, now));
        guard.insert(Arc::clone(&fresh));
        inner.after_access(&mut guard, now);
        drop(guard);
        Counters::bump(&inner.counters.misses, 1);
        tracing::trace!(code, score = fresh.score(), "cache miss");
        Ok(fresh)
    }

    /// Look up `(code, key)` without touching or building it.
    #[must_use]
    pub fn peek(&self, code: &'static str, key: &K) -> Option<Arc<CacheObject<K, V>>> {
        let hash = hash_of(code, key);
        self.inner.bin(hash).lock().find(hash, code, key).cloned()
    }

    /// Run a maintenance pass over every bin now. Returns objects evicted.
    pub fn maintain(&self) -> usize {
        self.inner.maintain_all()
    }

    /// Objects currently published.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.bins.iter().map(|bin| bin.lock().live()).sum()
    }

    /// Whether no object is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total hash chains across bins.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.bins.iter().map(|bin| bin.lock().capacity()).sum()
    }

    /// The configuration whose clock this cache decays by.
    #[must_use]
    pub fn conf(&self) -> &CacheConf {
        &self.inner.conf
    }

    /// Get cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot()
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn bin(&self, hash: u64) -> &Mutex<Bin<K, V>> {
        &self.bins[(hash % self.bins.len() as u64) as usize]
    }

    fn touch_existing(
        &self,
        bin: &Mutex<Bin<K, V>>,
        hash: u64,
        code: &'static str,
        key: &K,
    ) -> Option<Arc<CacheObject<K, V>>> {
        let mut guard = bin.lock();
        let hit = guard.find(hash, code, key).cloned()?;
        let now = self.conf.now();
        let score = hit.touch(now);
        self.after_access(&mut guard, now);
        drop(guard);
        Counters::bump(&self.counters.hits, 1);
        tracing::trace!(code, score, "cache hit");
        Some(hit)
    }

    fn after_access(&self, bin: &mut Bin<K, V>, now: u64) {
        if bin.note_access() {
            let pass = bin.maintain(now, self.conf.config());
            self.record(pass);
        }
    }

    fn maintain_all(&self) -> usize {
        let now = self.conf.now();
        let config = self.conf.config();
        self.bins
            .iter()
            .map(|bin| {
                let pass = bin.lock().maintain(now, config);
                self.record(pass);
                pass.evicted
            })
            .sum()
    }

    fn record(&self, pass: Pass) {
        let c = &self.counters;
        Counters::bump(&c.passes, 1);
        Counters::bump(&c.evictions, pass.evicted as u64);
        if pass.to > pass.from {
            Counters::bump(&c.grows, 1);
        } else if pass.to < pass.from {
            Counters::bump(&c.shrinks, 1);
        }
        if pass.to != pass.from {
            tracing::debug!(from = pass.from, to = pass.to, "cache bin resized");
        }
    }
}

impl<K, V> Sweep for CacheInner<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn sweep(&self) -> usize {
        self.maintain_all()
    }
}

impl<K, V> std::fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("bins", &self.inner.bins.len())
            .field("stats", &self.inner.counters.snapshot())
            .finish_non_exhaustive()
    }
}

fn hash_of<K: Hash>(code: &str, key: &K) -> u64 {
    let mut hasher = FxHasher::default();
    code.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}
