//! Versioned, persistent response cache.
//!
//! This module provides the storage side of the delivery layer:
//! - Four named partitions per cache version (static, images, pages, api)
//! - Responses keyed by normalized request identity (method + URL)
//! - Purging of every partition that does not belong to the current version
//! - Provenance of served responses (network, cache, fallback, synthesized)

mod partition;
mod storage;
mod traits;

pub use partition::{CacheVersion, Partition, RequestKey};
pub use storage::{CacheStorage, CachedResponse, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
