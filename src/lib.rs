//! shadowsync: a cache with a relational shadow
//!
//! Commands run against a Redis-style cache and are mirrored into per-key
//! shadow tables in SQLite or PostgreSQL. Cache misses read through to the
//! shadow tables and backfill the cache.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod keys;
pub mod sync;

pub use config::SyncConfig;
pub use error::{CacheError, ConfigError, DurableError, SyncError, SyncResult};
pub use keys::{KeyMapper, MappedKey, StructureKind};
pub use sync::{FailedStore, SyncEngine, SyncFailure};
