//! Independently locked groups of hash chains.

use crate::config::CacheConfig;
use crate::object::CacheObject;
use std::sync::Arc;

/// Outcome of one maintenance pass over a bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pass {
    pub(crate) evicted: usize,
    pub(crate) from: usize,
    pub(crate) to: usize,
}

pub(crate) struct Bin<K, V> {
    chains: Vec<Vec<Arc<CacheObject<K, V>>>>,
    live: usize,
    /// Accesses since the last pass.
    accesses: usize,
}

impl<K: Eq, V> Bin<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            chains: empty_chains(capacity),
            live: 0,
            accesses: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.chains.len()
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn find(&self, hash: u64, code: &str, key: &K) -> Option<&Arc<CacheObject<K, V>>> {
        self.chains[slot(hash, self.capacity())]
            .iter()
            .find(|obj| obj.hash() == hash && obj.code() == code && obj.key() == key)
    }

    pub(crate) fn insert(&mut self, obj: Arc<CacheObject<K, V>>) {
        let at = slot(obj.hash(), self.capacity());
        self.chains[at].push(obj);
        self.live += 1;
    }

    /// Count an access; true once a pass is due.
    pub(crate) fn note_access(&mut self) -> bool {
        self.accesses += 1;
        self.accesses >= self.capacity()
    }

    /// Evict uncompetitive objects, then resize to keep the fill ratio
    /// within bounds.
    pub(crate) fn maintain(&mut self, now: u64, config: &CacheConfig) -> Pass {
        self.accesses = 0;
        for chain in &mut self.chains {
            chain.retain(|obj| obj.competitive(now, config.threshold));
        }
        let before = self.live;
        self.live = self.chains.iter().map(Vec::len).sum();

        let from = self.capacity();
        let fill = self.live as f64 / from as f64;
        let to = if fill > config.max_fill {
            from * 2
        } else if fill < config.min_fill {
            (from / 2).max(config.min_capacity)
        } else {
            from
        };
        if to != from {
            self.rehash(to);
        }
        Pass {
            evicted: before - self.live,
            from,
            to,
        }
    }

    fn rehash(&mut self, capacity: usize) {
        let old = std::mem::replace(&mut self.chains, empty_chains(capacity));
        for obj in old.into_iter().flatten() {
            let at = slot(obj.hash(), capacity);
            self.chains[at].push(obj);
        }
    }
}

fn empty_chains<T>(capacity: usize) -> Vec<Vec<T>> {
    (0..capacity).map(|_| Vec::new()).collect()
}

/// Chain index; uses the high half so it is independent of the bin index.
fn slot(hash: u64, capacity: usize) -> usize {
    (hash.rotate_right(32) % capacity as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Built;
    use std::num::NonZeroU32;

    fn obj(key: u32, gain: u32, now: u64) -> Arc<CacheObject<u32, ()>> {
        let built = Built::new((), NonZeroU32::new(gain).unwrap());
        Arc::new(CacheObject::new("f", key, u64::from(key) << 32, built, now))
    }

    fn config() -> CacheConfig {
        CacheConfig {
            min_capacity: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_find_matches_code_and_key() {
        let mut bin = Bin::new(4);
        bin.insert(obj(1, 1, 0));
        assert!(bin.find(1 << 32, "f", &1).is_some());
        assert!(bin.find(1 << 32, "g", &1).is_none());
        assert!(bin.find(2 << 32, "f", &2).is_none());
    }

    #[test]
    fn test_access_counter_triggers_at_capacity() {
        let mut bin: Bin<u32, ()> = Bin::new(4);
        assert!(!bin.note_access());
        assert!(!bin.note_access());
        assert!(!bin.note_access());
        assert!(bin.note_access());
    }

    #[test]
    fn test_pass_evicts_decayed_objects() {
        let mut bin = Bin::new(4);
        bin.insert(obj(1, 1, 0));
        bin.insert(obj(2, 1 << 20, 0));
        let pass = bin.maintain(8, &config());
        assert_eq!(pass.evicted, 1);
        assert_eq!(bin.live(), 1);
        assert!(bin.find(2 << 32, "f", &2).is_some());
    }

    #[test]
    fn test_pass_grows_when_crowded() {
        let mut bin = Bin::new(4);
        for key in 0..9 {
            bin.insert(obj(key, 100, 0));
        }
        let pass = bin.maintain(0, &config());
        assert_eq!((pass.from, pass.to), (4, 8));
        for key in 0..9 {
            assert!(bin.find(u64::from(key) << 32, "f", &key).is_some());
        }
    }

    #[test]
    fn test_pass_shrinks_to_floor() {
        let mut bin: Bin<u32, ()> = Bin::new(16);
        let pass = bin.maintain(0, &config());
        assert_eq!((pass.from, pass.to), (16, 8));
        bin.maintain(0, &config());
        let pass = bin.maintain(0, &config());
        assert_eq!((pass.from, pass.to), (4, 4));
    }
}
