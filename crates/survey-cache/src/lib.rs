//! survey-cache: content-addressed response cache (Layer 0)
//!
//! Every model call made during a survey run is addressed by a SHA-256
//! [`Fingerprint`] of its [`CacheKey`] (model, parameters, rendered prompts,
//! iteration). Entries are immutable once written.
//!
//! - [`CacheStore`]: append-only keyed store trait
//! - [`MemoryCacheStore`] / [`FsCacheStore`]: in-process and sharded on-disk backends
//! - [`ResponseCache`]: single-flight `get_or_compute` over any store

pub mod cache;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod fs;
pub mod store;

pub use cache::{CacheStats, LookupOutcome, ResponseCache};
pub use entry::{CacheEntry, Usage};
pub use error::{CacheError, CacheResult};
pub use fingerprint::{CacheKey, Fingerprint};
pub use fs::FsCacheStore;
pub use store::{CacheStore, MemoryCacheStore};
