//! Cache behaviour observable through the public API.
//!
//! 1. Without ticks, repeated calls return one object whose score grows by
//!    its gain each time
//! 2. Once decay zeroes the score, maintenance evicts and the next call
//!    rebuilds
//! 3. The tick job advances the clock on worker threads until unwanted

use cuflow_cache::{Built, Cache, CacheConf, CacheConfig, CacheError};
use cuflow_sched::{WorkQueue, Workers};
use proptest::prelude::*;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn conf() -> CacheConf {
    CacheConf::new(CacheConfig::default()).unwrap()
}

fn gain(g: u32) -> NonZeroU32 {
    NonZeroU32::new(g).unwrap()
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

// ============================================================================
// Decay and eviction
// ============================================================================

#[test]
fn test_gain_ten_scenario() {
    let conf = conf();
    let cache: Cache<&'static str, String> = Cache::new(&conf);
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&builds);
    cache.register("fn", move |key: &&'static str| {
        counter.fetch_add(1, Ordering::SeqCst);
        Built::new(format!("value of {key}"), gain(10))
    });

    let first = cache.call("fn", &"k1").unwrap();
    for _ in 0..4 {
        let again = cache.call("fn", &"k1").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }
    assert_eq!(first.score(), 50);
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    conf.advance(64);
    assert_eq!(cache.maintain(), 1);
    assert!(cache.peek("fn", &"k1").is_none());

    let rebuilt = cache.call("fn", &"k1").unwrap();
    assert!(!Arc::ptr_eq(&first, &rebuilt));
    assert_eq!(rebuilt.score(), 10);
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    // the evicted object stays usable by whoever holds it
    assert_eq!(first.value(), "value of k1");
}

proptest! {
    #[test]
    fn score_grows_by_gain_without_ticks(g in 1u32..1000, calls in 1usize..40) {
        let conf = conf();
        let cache: Cache<u32, ()> = Cache::new(&conf);
        cache.register("unit", move |_| Built::new((), gain(g)));
        let mut last = 0;
        for _ in 0..calls {
            let obj = cache.call("unit", &0).unwrap();
            prop_assert_eq!(obj.score(), last + g);
            last = obj.score();
        }
    }
}

#[test]
fn test_heavy_objects_need_more_score() {
    let conf = CacheConf::new(CacheConfig {
        threshold: 2,
        ..Default::default()
    })
    .unwrap();
    let cache: Cache<u32, Vec<u8>> = Cache::new(&conf);
    cache.register("blob", |&n| Built::new(vec![0; n as usize], gain(64)).with_cost(n as usize));
    cache.call("blob", &8).unwrap();
    cache.call("blob", &64).unwrap();
    // 64 / 8 >= 2 survives, 64 / 64 < 2 goes
    assert_eq!(cache.maintain(), 1);
    assert!(cache.peek("blob", &8).is_some());
    assert!(cache.peek("blob", &64).is_none());
}

#[test]
fn test_unregistered_code_is_error() {
    let cache: Cache<u32, u32> = Cache::new(&conf());
    assert!(matches!(
        cache.call("missing", &1),
        Err(CacheError::UnknownCode { code: "missing" })
    ));
}

#[test]
fn test_concurrent_callers_share_one_object() {
    let conf = conf();
    let cache: Cache<u32, u32> = Cache::new(&conf);
    cache.register("slow", |&k| {
        thread::sleep(Duration::from_millis(5));
        Built::new(k + 1, gain(1))
    });

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || cache.call("slow", &42).unwrap())
        })
        .collect();
    let objects: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(objects.iter().all(|o| Arc::ptr_eq(o, &objects[0])));
    assert_eq!(cache.len(), 1);
    assert_eq!(objects[0].score(), 8);
}

#[test]
fn test_many_keys_grow_bins() {
    let conf = CacheConf::new(CacheConfig {
        bins: 2,
        min_capacity: 4,
        ..Default::default()
    })
    .unwrap();
    let cache: Cache<u32, u32> = Cache::new(&conf);
    cache.register("id", |&k| Built::new(k, gain(1 << 16)));
    for key in 0..200 {
        cache.call("id", &key).unwrap();
    }
    assert_eq!(cache.len(), 200);
    assert!(cache.capacity() > 8);
    assert!(cache.stats().grows > 0);
}

// ============================================================================
// Background ticking
// ============================================================================

#[test]
fn test_tick_job_advances_clock() {
    let queue = WorkQueue::new();
    let workers = Workers::with_default_config(&queue);
    workers.spawn(1).unwrap();

    let conf = CacheConf::new(CacheConfig {
        tick_period: Duration::from_millis(2),
        ..Default::default()
    })
    .unwrap();
    assert!(conf.start(&workers));
    assert!(!conf.start(&workers));
    assert!(wait_until(|| conf.now() >= 3));
}

#[test]
fn test_manager_stops_ticking() {
    let queue = WorkQueue::new();
    let workers = Workers::with_default_config(&queue);
    workers.spawn(1).unwrap();

    let conf = CacheConf::new(CacheConfig {
        tick_period: Duration::from_millis(1),
        ..Default::default()
    })
    .unwrap();
    let wanted = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&wanted);
    conf.set_manager(move || flag.load(Ordering::SeqCst));
    conf.start(&workers);
    assert!(wait_until(|| conf.now() >= 2));

    wanted.store(false, Ordering::SeqCst);
    assert!(wait_until(|| !conf.is_running()));
    let stopped_at = conf.now();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(conf.now(), stopped_at);
}

#[test]
fn test_periodic_sweep_evicts_idle_objects() {
    let queue = WorkQueue::new();
    let workers = Workers::with_default_config(&queue);
    workers.spawn(1).unwrap();

    let conf = CacheConf::new(CacheConfig {
        tick_period: Duration::from_millis(1),
        sweep_interval: 40,
        ..Default::default()
    })
    .unwrap();
    let cache: Cache<u32, u32> = Cache::new(&conf);
    cache.register("id", |&k| Built::new(k, gain(100)));
    cache.call("id", &1).unwrap();
    conf.start(&workers);
    assert!(wait_until(|| cache.is_empty()));
}
