use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cache::CacheConfig;
use crate::error::ConfigError;

/// Substitute `$NAME` and `${NAME}` with environment values (unset is empty).
/// A `$` not followed by a name is kept as is.
fn expand_env_vars(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  let mut rest = input;
  while let Some(at) = rest.find('$') {
    out.push_str(&rest[..at]);
    let after = &rest[at + 1..];
    if let Some(braced) = after.strip_prefix('{') {
      if let Some(close) = braced.find('}') {
        out.push_str(&std::env::var(&braced[..close]).unwrap_or_default());
        rest = &braced[close + 1..];
        continue;
      }
    }
    let name_len = after
      .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
      .unwrap_or(after.len());
    if name_len == 0 {
      out.push('$');
    } else {
      out.push_str(&std::env::var(&after[..name_len]).unwrap_or_default());
    }
    rest = &after[name_len..];
  }
  out.push_str(rest);
  out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
  #[default]
  Sqlite,
  Postgres,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
  #[serde(default)]
  pub prefixes: PrefixConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub durable: DurableSection,
  #[serde(default)]
  pub events: EventsSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

/// Key prefix per structure kind. Each must be unique and usable as the
/// leading part of a table name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixConfig {
  #[serde(default = "default_string_prefix")]
  pub string: String,
  #[serde(default = "default_list_prefix")]
  pub list: String,
  #[serde(default = "default_set_prefix")]
  pub set: String,
  #[serde(default = "default_sorted_set_prefix")]
  pub sorted_set: String,
  #[serde(default = "default_hash_prefix")]
  pub hash: String,
}
fn default_string_prefix() -> String {
  "str".into()
}
fn default_list_prefix() -> String {
  "lst".into()
}
fn default_set_prefix() -> String {
  "set".into()
}
fn default_sorted_set_prefix() -> String {
  "zset".into()
}
fn default_hash_prefix() -> String {
  "hash".into()
}
impl Default for PrefixConfig {
  fn default() -> Self {
    Self {
      string: default_string_prefix(),
      list: default_list_prefix(),
      set: default_set_prefix(),
      sorted_set: default_sorted_set_prefix(),
      hash: default_hash_prefix(),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurableSection {
  #[serde(default)]
  pub backend: BackendType,
  #[serde(default)]
  pub postgres: PostgresSection,
  #[serde(default)]
  pub sqlite: SqliteSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSection {
  #[serde(default = "default_pg_url")]
  pub url: String,
  #[serde(default = "default_max_conn")]
  pub max_connections: usize,
}
fn default_pg_url() -> String {
  "postgres://localhost/shadowsync".into()
}
fn default_max_conn() -> usize {
  20
}
impl Default for PostgresSection {
  fn default() -> Self {
    Self {
      url: default_pg_url(),
      max_connections: default_max_conn(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSection {
  /// Database file, or `:memory:`
  #[serde(default = "default_sqlite_path")]
  pub path: String,
}
fn default_sqlite_path() -> String {
  "shadowsync.db".into()
}
impl Default for SqliteSection {
  fn default() -> Self {
    Self {
      path: default_sqlite_path(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsSection {
  /// Failure events buffered per subscriber before the slowest one lags
  #[serde(default = "default_event_capacity")]
  pub capacity: usize,
}
fn default_event_capacity() -> usize {
  1024
}
impl Default for EventsSection {
  fn default() -> Self {
    Self {
      capacity: default_event_capacity(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl SyncConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
      .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
    let expanded = expand_env_vars(content);
    serde_yaml::from_str(&expanded).map_err(|e| ConfigError::Load(e.to_string()))
  }

  pub fn find_and_load() -> Result<Option<Self>, ConfigError> {
    for p in ["shadowsync.yaml", "shadowsync.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  /// Credential and shape checks that don't need a connection
  pub fn validate(&self) -> Result<(), ConfigError> {
    self.cache.validate()?;
    match self.durable.backend {
      BackendType::Postgres if self.durable.postgres.url.trim().is_empty() => Err(
        ConfigError::MissingCredentials("durable.postgres.url is empty".to_string()),
      ),
      BackendType::Sqlite if self.durable.sqlite.path.trim().is_empty() => Err(ConfigError::Load(
        "durable.sqlite.path is empty".to_string(),
      )),
      _ => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_expand_env_vars() {
    std::env::set_var("SHADOWSYNC_TEST_HOST", "db.internal");
    assert_eq!(
      expand_env_vars("postgres://${SHADOWSYNC_TEST_HOST}/app"),
      "postgres://db.internal/app"
    );
    assert_eq!(expand_env_vars("$SHADOWSYNC_TEST_HOST:5432"), "db.internal:5432");
    assert_eq!(expand_env_vars("no vars"), "no vars");
    assert_eq!(expand_env_vars("a $ b ${unclosed"), "a $ b ${unclosed");
  }

  #[test]
  fn test_defaults() {
    let config = SyncConfig::default();
    assert_eq!(config.prefixes.sorted_set, "zset");
    assert_eq!(config.durable.backend, BackendType::Sqlite);
    assert_eq!(config.events.capacity, 1024);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = SyncConfig::from_yaml(
      r#"
prefixes:
  hash: h
durable:
  backend: postgres
  postgres:
    url: postgres://localhost/test
"#,
    )
    .unwrap();
    assert_eq!(config.prefixes.hash, "h");
    assert_eq!(config.prefixes.string, "str");
    assert_eq!(config.durable.backend, BackendType::Postgres);
    assert_eq!(config.durable.postgres.max_connections, 20);
  }

  #[test]
  fn test_empty_postgres_url_is_missing_credentials() {
    let mut config = SyncConfig::default();
    config.durable.backend = BackendType::Postgres;
    config.durable.postgres.url = String::new();
    assert!(matches!(
      config.validate(),
      Err(ConfigError::MissingCredentials(_))
    ));
  }
}
