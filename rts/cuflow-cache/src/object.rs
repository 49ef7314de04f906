//! Cached objects and their decaying score.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Width of an object's score in bits.
pub const SCORE_BITS: u32 = 32;

/// Decay `score` by `elapsed` ticks: one right shift per tick.
#[must_use]
pub const fn decay(score: u32, elapsed: u64) -> u32 {
    if elapsed >= SCORE_BITS as u64 {
        0
    } else {
        score >> elapsed
    }
}

/// What a constructor hands back to the cache.
#[derive(Debug, Clone)]
pub struct Built<V> {
    pub(crate) value: V,
    pub(crate) gain: NonZeroU32,
    pub(crate) cost: usize,
}

impl<V> Built<V> {
    /// A value gaining `gain` score per access, costed at its inline size.
    #[must_use]
    pub fn new(value: V, gain: NonZeroU32) -> Self {
        Self {
            value,
            gain,
            cost: std::mem::size_of::<V>(),
        }
    }

    /// Set the byte cost the eviction predicate weighs the score against.
    #[must_use]
    pub fn with_cost(mut self, bytes: usize) -> Self {
        self.cost = bytes;
        self
    }
}

/// A value held by a [`Cache`](crate::Cache).
///
/// Score and last tick only change under the owning bin's lock; the
/// relaxed atomics just let readers holding an `Arc` look at them.
pub struct CacheObject<K, V> {
    code: &'static str,
    key: K,
    value: V,
    hash: u64,
    gain: NonZeroU32,
    cost: usize,
    score: AtomicU32,
    last_tick: AtomicU64,
}

impl<K, V> CacheObject<K, V> {
    pub(crate) fn new(code: &'static str, key: K, hash: u64, built: Built<V>, now: u64) -> Self {
        Self {
            code,
            key,
            hash,
            value: built.value,
            gain: built.gain,
            cost: built.cost,
            score: AtomicU32::new(built.gain.get()),
            last_tick: AtomicU64::new(now),
        }
    }

    /// The cached value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The key it was built for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The function code it was built by.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Score added per access.
    #[must_use]
    pub fn gain(&self) -> NonZeroU32 {
        self.gain
    }

    /// Byte cost; never below one.
    #[must_use]
    pub fn cost(&self) -> usize {
        self.cost.max(1)
    }

    /// Score as of the last touch.
    #[must_use]
    pub fn score(&self) -> u32 {
        self.score.load(Ordering::Relaxed)
    }

    /// Tick of the last touch.
    #[must_use]
    pub fn last_tick(&self) -> u64 {
        self.last_tick.load(Ordering::Relaxed)
    }

    /// Score decayed to tick `now`.
    #[must_use]
    pub fn score_at(&self, now: u64) -> u32 {
        decay(self.score(), now.saturating_sub(self.last_tick()))
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }

    /// Record an access at `now`.
    pub(crate) fn touch(&self, now: u64) -> u32 {
        let score = self.score_at(now).saturating_add(self.gain.get());
        self.score.store(score, Ordering::Relaxed);
        self.last_tick.store(now.max(self.last_tick()), Ordering::Relaxed);
        score
    }

    /// Whether the object is worth keeping at `now`.
    pub(crate) fn competitive(&self, now: u64, threshold: u32) -> bool {
        let floor = u64::from(threshold) * self.cost() as u64;
        u64::from(self.score_at(now)) >= floor
    }
}

impl<K: fmt::Debug, V> fmt::Debug for CacheObject<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheObject")
            .field("code", &self.code)
            .field("key", &self.key)
            .field("score", &self.score())
            .field("last_tick", &self.last_tick())
            .finish_non_exhaustive()
    }
}
