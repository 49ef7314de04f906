//! The three layers working together.

use cuflow::{
    catch, explore, fail, split, throw, Built, Flexq, FlowMode, Priority, Runtime, RuntimeConfig,
};
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn runtime(workers: usize) -> Runtime {
    Runtime::new(RuntimeConfig {
        workers,
        ..Default::default()
    })
    .unwrap()
}

/// Number of ways to place `n` non-attacking queens.
fn queens(n: usize) -> usize {
    let mut count = 0;
    explore(
        FlowMode::NONDET,
        || {
            let mut cols: Vec<usize> = Vec::with_capacity(n);
            for row in 0..n {
                let col = split(n);
                let clash = cols
                    .iter()
                    .enumerate()
                    .any(|(r, &c)| c == col || row - r == col.abs_diff(c));
                if clash {
                    fail();
                }
                cols.push(col);
            }
        },
        |()| count += 1,
    );
    count
}

#[test]
fn test_searches_run_on_workers() {
    let runtime = runtime(4);
    let (tx, rx) = mpsc::channel();
    for n in 4..=7 {
        let tx = tx.clone();
        runtime.queue().sched_at(Priority::saturating(n % 3), move || {
            tx.send((n, queens(n))).unwrap();
        });
    }
    let mut found: Vec<_> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    found.sort_unstable();
    assert_eq!(found, vec![(4, 2), (5, 10), (6, 4), (7, 40)]);
}

#[test]
fn test_cache_memoizes_search_results() {
    let runtime = runtime(2);
    let cache = runtime.cache::<usize, usize>();
    cache.register("queens", |&n| Built::new(queens(n), NonZeroU32::new(1).unwrap()));

    let (tx, rx) = mpsc::channel();
    for _ in 0..6 {
        let cache = cache.clone();
        let tx = tx.clone();
        runtime.workers().call(move || {
            let obj = cache.call("queens", &6).unwrap();
            tx.send(*obj.value()).unwrap();
        });
    }
    for _ in 0..6 {
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 4);
    }
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().hits + cache.stats().misses, 6);
}

#[test]
fn test_exceptions_stay_inside_their_job() {
    let runtime = runtime(1);
    let (tx, rx) = mpsc::channel();
    runtime.queue().sched(move || {
        let r = catch(|| throw(String::from("inside job")), |e| e.downcast::<String>().ok());
        tx.send(r).unwrap();
    });
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        Some(String::from("inside job"))
    );
}

#[test]
fn test_inherited_priority_orders_work() {
    let runtime = runtime(0);
    let queue = runtime.queue().clone();
    let log = Arc::new(Mutex::new(Vec::new()));

    let low = Arc::clone(&log);
    queue.sched_at(Priority::saturating(3), move || low.lock().push("plain p3"));

    let q = queue.clone();
    let nested = Arc::clone(&log);
    queue.sched_at(Priority::saturating(6), move || {
        let fq = Flexq::new(&q, Priority::MIN);
        let _inside = fq.enter_scoped();
        let nested = Arc::clone(&nested);
        fq.sched(move || nested.lock().push("inherited p6"));
    });

    queue.yield_all();
    assert_eq!(*log.lock(), vec!["inherited p6", "plain p3"]);
}

#[test]
fn test_runtime_clock_ticks() {
    let runtime = Runtime::new(RuntimeConfig {
        workers: 1,
        cache: cuflow::CacheConfig {
            tick_period: Duration::from_millis(1),
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    let deadline = Instant::now() + WAIT;
    while runtime.cache_conf().now() < 5 {
        assert!(Instant::now() < deadline, "clock did not advance");
        std::thread::sleep(Duration::from_millis(1));
    }
}
