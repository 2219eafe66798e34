//! Configuration and key mapping tests

use std::io::Write;

use shadowsync::cache::{CacheMode, EvictionPolicy};
use shadowsync::config::{BackendType, PrefixConfig, SyncConfig};
use shadowsync::{ConfigError, KeyMapper, StructureKind, SyncError};

// =============================================================================
// YAML Loading
// =============================================================================

#[test]
fn test_full_yaml() {
  let yaml = r#"
prefixes:
  string: s
  list: l
  set: st
  sorted_set: z
  hash: h
cache:
  mode: proxy
  max_memory: 64mb
  eviction: lfu
  default_ttl: 30
  proxy:
    host: redis.internal
    port: 6380
    database: 2
durable:
  backend: postgres
  postgres:
    url: postgres://app@db/shadow
    max_connections: 8
events:
  capacity: 16
logging:
  level: debug
"#;

  let config = SyncConfig::from_yaml(yaml).unwrap();
  assert_eq!(config.prefixes.sorted_set, "z");
  assert_eq!(config.cache.mode, CacheMode::Proxy);
  assert_eq!(config.cache.eviction, EvictionPolicy::Lfu);
  assert_eq!(config.cache.max_memory_bytes(), 64 * 1024 * 1024);
  assert_eq!(config.cache.default_ttl().map(|d| d.as_secs()), Some(30));
  assert_eq!(config.cache.proxy.connection_url(), "redis://redis.internal:6380/2");
  assert_eq!(config.durable.backend, BackendType::Postgres);
  assert_eq!(config.durable.postgres.max_connections, 8);
  assert_eq!(config.events.capacity, 16);
  assert_eq!(config.logging.level, "debug");
  assert!(config.validate().is_ok());
}

#[test]
fn test_env_expansion_in_file() {
  std::env::set_var("SHADOWSYNC_IT_DB", "/tmp/shadow-it.db");
  let mut file = tempfile::NamedTempFile::new().unwrap();
  writeln!(file, "durable:\n  sqlite:\n    path: ${{SHADOWSYNC_IT_DB}}").unwrap();

  let config = SyncConfig::from_file(file.path()).unwrap();
  assert_eq!(config.durable.sqlite.path, "/tmp/shadow-it.db");
}

#[test]
fn test_missing_file_is_load_error() {
  assert!(matches!(
    SyncConfig::from_file("/nonexistent/shadowsync.yaml"),
    Err(ConfigError::Load(_))
  ));
}

#[test]
fn test_proxy_without_host_is_missing_credentials() {
  let config = SyncConfig::from_yaml("cache:\n  mode: proxy\n  proxy:\n    host: \"\"\n").unwrap();
  assert!(matches!(
    config.validate(),
    Err(ConfigError::MissingCredentials(_))
  ));
}

#[test]
fn test_bad_memory_size_rejected() {
  let config = SyncConfig::from_yaml("cache:\n  max_memory: lots\n").unwrap();
  assert!(matches!(config.validate(), Err(ConfigError::Load(_))));
}

// =============================================================================
// Prefix Registry
// =============================================================================

fn prefixes(string: &str, hash: &str) -> PrefixConfig {
  PrefixConfig {
    string: string.to_string(),
    hash: hash.to_string(),
    ..PrefixConfig::default()
  }
}

#[test]
fn test_duplicate_prefix_rejected() {
  assert!(matches!(
    KeyMapper::new(&prefixes("kv", "kv")),
    Err(ConfigError::DuplicatePrefix { .. })
  ));
}

#[test]
fn test_empty_and_unsafe_prefixes_rejected() {
  assert!(matches!(
    KeyMapper::new(&prefixes("", "hash")),
    Err(ConfigError::EmptyPrefix { .. })
  ));
  assert!(matches!(
    KeyMapper::new(&prefixes("str", "ha-sh")),
    Err(ConfigError::InvalidPrefix { .. })
  ));
}

#[test]
fn test_key_mapping_per_kind() {
  let keys = KeyMapper::new(&PrefixConfig::default()).unwrap();

  let s = keys.string_key("users", "42").unwrap();
  assert_eq!(s.cache_key, "str:users:42");
  assert_eq!(s.table, "str_users");
  assert_eq!(s.row_key(), Some("42"));

  let h = keys.parse("hash:users:7").unwrap();
  assert_eq!(h.kind, StructureKind::Hash);
  assert_eq!(h.table, "hash_users_7");

  let z = keys.parse("zset:board").unwrap();
  assert_eq!(z.kind, StructureKind::SortedSet);
  assert_eq!(z.table, "zset_board");
}

#[test]
fn test_key_mapping_rejects_bad_keys() {
  let keys = KeyMapper::new(&PrefixConfig::default()).unwrap();
  assert!(matches!(keys.parse("nope:x"), Err(SyncError::Config(ConfigError::UnknownPrefix(_)))));
  assert!(matches!(keys.parse("str:users"), Err(SyncError::Validation(_))));
  assert!(matches!(keys.parse("set"), Err(SyncError::Validation(_))));
  assert!(matches!(keys.parse("set:bad name"), Err(SyncError::Validation(_))));
}
