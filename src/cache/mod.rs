//! Cache side of the sync engine
//!
//! - Native string, list, set, sorted-set and hash values
//! - A command/reply model shared by every backend
//! - Atomic multi-command execution for read-modify-write sequences
//! - Builtin in-memory store or a proxy to an external Redis

mod command;
pub mod config;
mod entry;
#[cfg(feature = "redis-proxy")]
pub mod proxy;
mod store;

pub use command::{
  format_score, CacheCommand, CacheReply, InsertPosition, ScoreBound, ScoreRange,
};
pub use config::{CacheConfig, CacheMode, CacheProxyConfig};
pub use entry::{CacheEntry, CacheValue};
#[cfg(feature = "redis-proxy")]
pub use proxy::RedisProxyClient;
pub use store::{CacheStats, CacheStore, EvictionPolicy, InMemoryCacheStore};
