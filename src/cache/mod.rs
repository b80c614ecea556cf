//! In-memory post cache
//!
//! Mirrors every stored post so reads don't round-trip to the storage backend.

pub mod posts;

pub use posts::{CacheStats, PostCache, RefreshPolicy, Snapshot, DEFAULT_FRESHNESS_WINDOW};
