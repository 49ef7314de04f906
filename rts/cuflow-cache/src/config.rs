//! Cache configuration and the shared tick clock.

use crate::error::{CacheError, CacheResult};
use cuflow_sched::{WorkQueue, Workers};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Tunables for a family of caches sharing one tick clock.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Wall-clock length of one tick.
    pub tick_period: Duration,
    /// Minimum decayed score per byte of cost an object needs to survive
    /// a maintenance pass.
    pub threshold: u32,
    /// Halve a bin's capacity when its live/capacity ratio drops below this.
    /// Must be at most half of `max_fill`.
    pub min_fill: f64,
    /// Double a bin's capacity when its live/capacity ratio exceeds this.
    pub max_fill: f64,
    /// Capacity floor per bin.
    pub min_capacity: usize,
    /// Number of independently locked bins per cache.
    pub bins: usize,
    /// Sweep every registered cache once per this many ticks; 0 disables.
    pub sweep_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(100),
            threshold: 1,
            min_fill: 0.25,
            max_fill: 2.0,
            min_capacity: 16,
            bins: 16,
            sweep_interval: 64,
        }
    }
}

impl CacheConfig {
    /// Check every field is in range.
    pub fn validate(&self) -> CacheResult<()> {
        let invalid = |msg: &str| Err(CacheError::InvalidConfig(msg.to_string()));
        if self.tick_period.is_zero() {
            return invalid("tick_period must be non-zero");
        }
        if self.bins == 0 {
            return invalid("bins must be non-zero");
        }
        if self.min_capacity == 0 {
            return invalid("min_capacity must be non-zero");
        }
        if !(self.min_fill >= 0.0 && self.min_fill < self.max_fill) {
            return invalid("min_fill must be non-negative and below max_fill");
        }
        if self.max_fill < 2.0 * self.min_fill {
            // a doubled bin would fall under min_fill and halve right back
            return invalid("max_fill must be at least twice min_fill");
        }
        if self.max_fill > f64::from(u32::MAX) {
            return invalid("max_fill is out of range");
        }
        Ok(())
    }
}

/// Something the tick job sweeps periodically.
pub(crate) trait Sweep: Send + Sync {
    fn sweep(&self) -> usize;
}

type Manager = Arc<dyn Fn() -> bool + Send + Sync>;

struct ConfInner {
    config: CacheConfig,
    ticks: AtomicU64,
    running: AtomicBool,
    manager: RwLock<Option<Manager>>,
    caches: Mutex<Vec<Weak<dyn Sweep>>>,
}

impl ConfInner {
    fn wanted(&self) -> bool {
        let manager = self.manager.read().clone();
        manager.map_or(true, |still_wanted| (still_wanted.as_ref())())
    }

    fn sweep_caches(&self) -> usize {
        let live: Vec<Arc<dyn Sweep>> = {
            let mut caches = self.caches.lock();
            caches.retain(|cache| cache.strong_count() > 0);
            caches.iter().filter_map(Weak::upgrade).collect()
        };
        live.iter().map(|cache| cache.sweep()).sum()
    }
}

/// A cache configuration and the tick clock its caches decay by.
///
/// Cloning yields another handle to the same clock.
#[derive(Clone)]
pub struct CacheConf {
    inner: Arc<ConfInner>,
}

impl CacheConf {
    /// Create a clock at tick 0.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ConfInner {
                config,
                ticks: AtomicU64::new(0),
                running: AtomicBool::new(false),
                manager: RwLock::new(None),
                caches: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Current tick.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.inner.ticks.load(Ordering::Acquire)
    }

    /// Advance the clock by one tick.
    pub fn tick(&self) -> u64 {
        self.advance(1)
    }

    /// Advance the clock by `n` ticks, returning the new tick.
    pub fn advance(&self, n: u64) -> u64 {
        self.inner.ticks.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Install the predicate the tick job consults before each tick; the
    /// job stops for good the first time it returns false.
    pub fn set_manager(&self, still_wanted: impl Fn() -> bool + Send + Sync + 'static) {
        *self.inner.manager.write() = Some(Arc::new(still_wanted));
    }

    /// Whether the tick job is scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Schedule the self-rescheduling tick job on the pool's timer queue.
    /// Returns false if it was already running.
    ///
    /// The job stops once every handle to this configuration is dropped or
    /// the manager predicate returns false.
    pub fn start(&self, workers: &Workers) -> bool {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let first = Instant::now() + self.inner.config.tick_period;
        schedule_tick(Arc::downgrade(&self.inner), workers.queue().clone(), first);
        tracing::debug!(period = ?self.inner.config.tick_period, "cache ticking started");
        true
    }

    pub(crate) fn register(&self, cache: Weak<dyn Sweep>) {
        self.inner.caches.lock().push(cache);
    }

    /// Sweep every live cache sharing this clock. Returns objects evicted.
    pub fn sweep_all(&self) -> usize {
        self.inner.sweep_caches()
    }
}

impl std::fmt::Debug for CacheConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConf")
            .field("config", &self.inner.config)
            .field("now", &self.now())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn schedule_tick(conf: Weak<ConfInner>, queue: WorkQueue, deadline: Instant) {
    let next_queue = queue.clone();
    queue.call_at(deadline, move || {
        let Some(inner) = conf.upgrade() else {
            return;
        };
        if !inner.wanted() {
            inner.running.store(false, Ordering::Release);
            tracing::debug!("cache ticking stopped");
            return;
        }
        let now = inner.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        let interval = inner.config.sweep_interval;
        if interval != 0 && now % interval == 0 {
            let evicted = inner.sweep_caches();
            tracing::debug!(tick = now, evicted, "cache sweep");
        }
        let next = deadline + inner.config.tick_period;
        drop(inner);
        schedule_tick(conf, next_queue, next);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_config() {
        let zero_bins = CacheConfig {
            bins: 0,
            ..Default::default()
        };
        assert!(matches!(
            CacheConf::new(zero_bins),
            Err(CacheError::InvalidConfig(_))
        ));
        let inverted = CacheConfig {
            min_fill: 3.0,
            max_fill: 1.0,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_rejects_fill_bounds_that_thrash() {
        let narrow = CacheConfig {
            min_fill: 0.6,
            max_fill: 1.0,
            ..Default::default()
        };
        assert_eq!(
            narrow.validate(),
            Err(CacheError::InvalidConfig(String::from(
                "max_fill must be at least twice min_fill"
            )))
        );
        let exact = CacheConfig {
            min_fill: 0.5,
            max_fill: 1.0,
            ..Default::default()
        };
        assert!(exact.validate().is_ok());
    }

    #[test]
    fn test_manual_clock() {
        let conf = CacheConf::new(CacheConfig::default()).unwrap();
        assert_eq!(conf.now(), 0);
        assert_eq!(conf.tick(), 1);
        assert_eq!(conf.advance(63), 64);
        assert_eq!(conf.clone().now(), 64);
    }
}
