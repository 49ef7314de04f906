//! Runtime initialization and shutdown.

use cuflow_cache::{Cache, CacheConf, CacheConfig, CacheError};
use cuflow_sched::{num_cpus, SchedError, WorkQueue, WorkerConfig, Workers};
use std::hash::Hash;
use thiserror::Error;

/// Result alias for runtime setup.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors raised while bringing a runtime up.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The worker pool could not start.
    #[error(transparent)]
    Sched(#[from] SchedError),
    /// The cache configuration was rejected.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Configuration for a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads to start.
    pub workers: usize,
    /// Worker thread settings.
    pub worker: WorkerConfig,
    /// Settings for the cache clock shared by the runtime's caches.
    pub cache: CacheConfig,
    /// Start the cache clock's tick job on the pool.
    pub tick_caches: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus(),
            worker: WorkerConfig::default(),
            cache: CacheConfig::default(),
            tick_caches: true,
        }
    }
}

/// A work queue, the pool serving it and a ticking cache clock.
///
/// Dropping the runtime stops its workers; the tick job ends with the last
/// handle to the cache clock.
pub struct Runtime {
    queue: WorkQueue,
    workers: Workers,
    cache_conf: CacheConf,
}

impl Runtime {
    /// Start a runtime.
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        let cache_conf = CacheConf::new(config.cache)?;
        let queue = WorkQueue::new();
        let workers = Workers::new(&queue, config.worker);
        workers.spawn(config.workers)?;
        if config.tick_caches {
            cache_conf.start(&workers);
        }
        tracing::debug!(workers = config.workers, "runtime started");
        Ok(Self {
            queue,
            workers,
            cache_conf,
        })
    }

    /// The shared work queue.
    #[must_use]
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// The worker pool.
    #[must_use]
    pub fn workers(&self) -> &Workers {
        &self.workers
    }

    /// The cache clock.
    #[must_use]
    pub fn cache_conf(&self) -> &CacheConf {
        &self.cache_conf
    }

    /// A new cache on the runtime's clock.
    #[must_use]
    pub fn cache<K, V>(&self) -> Cache<K, V>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        Cache::new(&self.cache_conf)
    }

    /// Stop and join every worker.
    pub fn shutdown(self) {
        tracing::debug!("runtime shutting down");
        drop(self);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.workers)
            .field("cache_conf", &self.cache_conf)
            .finish_non_exhaustive()
    }
}
