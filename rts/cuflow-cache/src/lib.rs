//! Decaying-score object cache for the cuflow runtime.
//!
//! A [`Cache`] memoizes constructor results keyed by a function code and a
//! key. Every object carries a popularity score that halves with each tick
//! of its [`CacheConf`] clock and grows by a fixed gain on each access.
//! Objects whose score per byte of cost falls below a threshold are evicted
//! by maintenance passes, which run once a bin has seen as many accesses as
//! it has chains, and periodically from the clock's tick job.
//!
//! ```
//! use cuflow_cache::{Built, Cache, CacheConf, CacheConfig};
//! use std::num::NonZeroU32;
//! use std::sync::Arc;
//!
//! let conf = CacheConf::new(CacheConfig::default()).unwrap();
//! let cache: Cache<String, usize> = Cache::new(&conf);
//! let gain = NonZeroU32::new(10).unwrap();
//! cache.register("len", move |s: &String| Built::new(s.len(), gain));
//!
//! let key = String::from("k1");
//! let first = cache.call("len", &key).unwrap();
//! for _ in 0..4 {
//!     assert!(Arc::ptr_eq(&first, &cache.call("len", &key).unwrap()));
//! }
//! assert_eq!(first.score(), 50);
//!
//! conf.advance(64);
//! cache.maintain();
//! let rebuilt = cache.call("len", &key).unwrap();
//! assert!(!Arc::ptr_eq(&first, &rebuilt));
//! assert_eq!(rebuilt.score(), 10);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod bin;
mod cache;
mod config;
mod error;
mod object;

pub use cache::{Cache, CacheStats, Constructor};
pub use config::{CacheConf, CacheConfig};
pub use error::{CacheError, CacheResult};
pub use object::{decay, Built, CacheObject, SCORE_BITS};
