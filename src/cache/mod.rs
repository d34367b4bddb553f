//! Offline resource cache.
//!
//! Keeps named cache generations of opaque resources in SQLite and serves requests
//! through a [`CacheManager`]:
//! - the app shell is precached on install
//! - the dynamic events feed is network-first with stale fallback
//! - everything else is cache-first, with the cached root document as the offline page

mod layer;
mod storage;
mod traits;

pub use layer::CacheManager;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Resource};
