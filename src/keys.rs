//! Logical key parsing and key/table mapping
//!
//! A logical key has the shape `prefix:bucket[:identifier]`. The prefix picks
//! the structure kind, `prefix_bucket` names the shadow table. String tables
//! hold many logical keys (one row per identifier); every other kind owns its
//! table outright, so a non-string identifier is folded into the table name.
//!
//! `_` joins the parts of a table name, so it may not appear in a prefix or
//! in a non-string bucket. Each table name then has exactly one key.

use serde::{Deserialize, Serialize};

use crate::config::PrefixConfig;
use crate::db::sanitize::{validate_identifier, validate_table_name};
use crate::error::{ConfigError, SyncError};

/// Name of the shared table recording key expirations.
pub const EXPIRY_TABLE: &str = "expiry";

const TABLE_SEPARATOR: &str = "_";

/// The five structure kinds mirrored into the durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
  String,
  List,
  Set,
  SortedSet,
  Hash,
}

impl StructureKind {
  /// Whether several logical keys share one table (rows keyed by identifier).
  pub fn shares_table(&self) -> bool {
    matches!(self, StructureKind::String)
  }
}

impl std::fmt::Display for StructureKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StructureKind::String => write!(f, "string"),
      StructureKind::List => write!(f, "list"),
      StructureKind::Set => write!(f, "set"),
      StructureKind::SortedSet => write!(f, "sorted-set"),
      StructureKind::Hash => write!(f, "hash"),
    }
  }
}

/// A logical key resolved to its cache key and shadow table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappedKey {
  pub kind: StructureKind,
  pub prefix: String,
  pub bucket: String,
  pub identifier: Option<String>,
  pub cache_key: String,
  pub table: String,
}

impl MappedKey {
  /// Row key inside a string table.
  pub fn row_key(&self) -> Option<&str> {
    self.identifier.as_deref()
  }

  pub fn has_identifier(&self) -> bool {
    self.identifier.is_some()
  }
}

/// Immutable prefix registry, validated once
#[derive(Debug, Clone)]
pub struct KeyMapper {
  prefixes: [(StructureKind, String); 5],
}

impl KeyMapper {
  pub fn new(config: &PrefixConfig) -> Result<Self, ConfigError> {
    let prefixes = [
      (StructureKind::String, config.string.clone()),
      (StructureKind::List, config.list.clone()),
      (StructureKind::Set, config.set.clone()),
      (StructureKind::SortedSet, config.sorted_set.clone()),
      (StructureKind::Hash, config.hash.clone()),
    ];

    for (i, (kind, prefix)) in prefixes.iter().enumerate() {
      if prefix.is_empty() {
        return Err(ConfigError::EmptyPrefix {
          kind: kind.to_string(),
        });
      }
      validate_identifier(prefix).map_err(|e| ConfigError::InvalidPrefix {
        prefix: prefix.clone(),
        reason: e.to_string(),
      })?;
      if prefix.contains(TABLE_SEPARATOR) {
        return Err(ConfigError::InvalidPrefix {
          prefix: prefix.clone(),
          reason: format!("'{}' separates table name parts", TABLE_SEPARATOR),
        });
      }
      if let Some((other, _)) = prefixes[..i].iter().find(|(_, p)| p == prefix) {
        return Err(ConfigError::DuplicatePrefix {
          prefix: prefix.clone(),
          first: other.to_string(),
          second: kind.to_string(),
        });
      }
    }

    Ok(Self { prefixes })
  }

  pub fn prefix(&self, kind: StructureKind) -> &str {
    self
      .prefixes
      .iter()
      .find(|(k, _)| *k == kind)
      .map(|(_, p)| p.as_str())
      .unwrap_or_default()
  }

  pub fn kind_of(&self, prefix: &str) -> Option<StructureKind> {
    self
      .prefixes
      .iter()
      .find(|(_, p)| p == prefix)
      .map(|(k, _)| *k)
  }

  /// Map `(prefix, bucket, identifier?)` to a cache key and table name.
  pub fn map(
    &self,
    prefix: &str,
    bucket: &str,
    identifier: Option<&str>,
  ) -> Result<MappedKey, SyncError> {
    let kind = self
      .kind_of(prefix)
      .ok_or_else(|| ConfigError::UnknownPrefix(prefix.to_string()))?;

    if bucket.is_empty() {
      return Err(SyncError::validation("bucket must not be empty"));
    }
    if identifier.is_some_and(str::is_empty) {
      return Err(SyncError::validation("key identifier must not be empty"));
    }
    if !kind.shares_table() && bucket.contains(TABLE_SEPARATOR) {
      return Err(SyncError::validation(format!(
        "{} bucket '{}' may not contain '{}'",
        kind, bucket, TABLE_SEPARATOR
      )));
    }
    if kind == StructureKind::String && identifier.is_none() {
      return Err(SyncError::validation(format!(
        "string key '{}:{}' needs an identifier",
        prefix, bucket
      )));
    }

    let table = match (kind.shares_table(), identifier) {
      (false, Some(id)) => [prefix, bucket, id].join(TABLE_SEPARATOR),
      _ => [prefix, bucket].join(TABLE_SEPARATOR),
    };
    validate_table_name(&table).map_err(|e| SyncError::validation(e.to_string()))?;

    let cache_key = match identifier {
      Some(id) => format!("{}:{}:{}", prefix, bucket, id),
      None => format!("{}:{}", prefix, bucket),
    };

    Ok(MappedKey {
      kind,
      prefix: prefix.to_string(),
      bucket: bucket.to_string(),
      identifier: identifier.map(str::to_string),
      cache_key,
      table,
    })
  }

  /// Parse a full logical key (`prefix:bucket[:identifier]`).
  pub fn parse(&self, logical: &str) -> Result<MappedKey, SyncError> {
    let mut parts = logical.splitn(3, ':');
    let prefix = parts.next().unwrap_or_default();
    let bucket = parts
      .next()
      .ok_or_else(|| SyncError::validation(format!("malformed key '{}'", logical)))?;
    self.map(prefix, bucket, parts.next())
  }

  /// Map a logical key that must be of the given kind.
  pub fn parse_kind(&self, logical: &str, kind: StructureKind) -> Result<MappedKey, SyncError> {
    let mapped = self.parse(logical)?;
    if mapped.kind != kind {
      return Err(SyncError::validation(format!(
        "key '{}' is a {} key, expected {}",
        logical, mapped.kind, kind
      )));
    }
    Ok(mapped)
  }

  /// Map a string key from its bucket and identifier.
  pub fn string_key(&self, bucket: &str, id: &str) -> Result<MappedKey, SyncError> {
    self.map(self.prefix(StructureKind::String), bucket, Some(id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mapper() -> KeyMapper {
    KeyMapper::new(&PrefixConfig::default()).unwrap()
  }

  #[test]
  fn test_map_string_key() {
    let key = mapper().string_key("users", "42").unwrap();
    assert_eq!(key.kind, StructureKind::String);
    assert_eq!(key.cache_key, "str:users:42");
    assert_eq!(key.table, "str_users");
    assert_eq!(key.row_key(), Some("42"));
  }

  #[test]
  fn test_parse_list_key_with_identifier() {
    let key = mapper().parse("lst:queue:high").unwrap();
    assert_eq!(key.kind, StructureKind::List);
    assert_eq!(key.cache_key, "lst:queue:high");
    assert_eq!(key.table, "lst_queue_high");
  }

  #[test]
  fn test_string_identifier_may_contain_colons() {
    let key = mapper().parse("str:sessions:a:b:c").unwrap();
    assert_eq!(key.identifier.as_deref(), Some("a:b:c"));
    assert_eq!(key.table, "str_sessions");
  }

  #[test]
  fn test_unknown_prefix_is_config_error() {
    let err = mapper().parse("nope:bucket").unwrap_err();
    assert_eq!(
      err,
      SyncError::Config(ConfigError::UnknownPrefix("nope".into()))
    );
  }

  #[test]
  fn test_duplicate_prefix_rejected() {
    let config = PrefixConfig {
      set: "lst".into(),
      ..PrefixConfig::default()
    };
    assert!(matches!(
      KeyMapper::new(&config),
      Err(ConfigError::DuplicatePrefix { .. })
    ));
  }

  #[test]
  fn test_string_key_requires_identifier() {
    assert!(matches!(
      mapper().parse("str:users"),
      Err(SyncError::Validation(_))
    ));
  }

  #[test]
  fn test_table_names_do_not_collide() {
    let keys = mapper();
    assert!(matches!(keys.parse("hash:a_b"), Err(SyncError::Validation(_))));
    assert!(matches!(keys.parse("lst:a_b:c"), Err(SyncError::Validation(_))));
    assert_eq!(keys.parse("hash:a:b").unwrap().table, "hash_a_b");
    // The identifier is the tail of the name, so it may keep its underscores.
    assert_eq!(keys.parse("set:a:b_c").unwrap().table, "set_a_b_c");
    // String buckets never take an identifier into the name.
    assert_eq!(keys.string_key("a_b", "1").unwrap().table, "str_a_b");
  }

  #[test]
  fn test_prefix_with_separator_rejected() {
    let config = PrefixConfig {
      hash: "h_x".into(),
      ..PrefixConfig::default()
    };
    assert!(matches!(
      KeyMapper::new(&config),
      Err(ConfigError::InvalidPrefix { .. })
    ));
  }

  #[test]
  fn test_unsafe_bucket_rejected() {
    assert!(mapper().parse("hash:users;drop").is_err());
    assert!(mapper().parse("hash:").is_err());
  }
}
