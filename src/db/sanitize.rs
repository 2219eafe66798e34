//! SQL identifier sanitization.
//!
//! Table names are built from user-chosen buckets, so they are validated
//! before they reach any statement and always emitted quoted. Values never
//! go through here; they are bound as parameters.

use thiserror::Error;

/// Postgres truncates identifiers beyond 63 bytes (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlSanitizeError {
  #[error("name is empty")]
  EmptyIdentifier,

  #[error("name is {0} bytes, the limit is {max}", max = MAX_IDENTIFIER_LENGTH)]
  IdentifierTooLong(usize),

  #[error("name must begin with a letter or '_', found '{0}'")]
  InvalidIdentifierStart(char),

  #[error("'{0}' is not allowed in a name")]
  InvalidIdentifierChar(char),

  #[error("'{0}' is not allowed in a table name")]
  InvalidTableChar(char),
}

/// Check a name fragment (structure prefix, bucket, identifier part):
/// `[A-Za-z_][A-Za-z0-9_]*`, at most [`MAX_IDENTIFIER_LENGTH`] bytes.
pub fn validate_identifier(name: &str) -> Result<(), SqlSanitizeError> {
  let mut chars = name.chars();
  let Some(lead) = chars.next() else {
    return Err(SqlSanitizeError::EmptyIdentifier);
  };
  if name.len() > MAX_IDENTIFIER_LENGTH {
    return Err(SqlSanitizeError::IdentifierTooLong(name.len()));
  }
  if lead != '_' && !lead.is_ascii_alphabetic() {
    return Err(SqlSanitizeError::InvalidIdentifierStart(lead));
  }
  match chars.find(|c| *c != '_' && !c.is_ascii_alphanumeric()) {
    Some(bad) => Err(SqlSanitizeError::InvalidIdentifierChar(bad)),
    None => Ok(()),
  }
}

/// Check a complete shadow table name (`prefix_bucket[_identifier]`).
pub fn validate_table_name(name: &str) -> Result<(), SqlSanitizeError> {
  match validate_identifier(name) {
    Err(SqlSanitizeError::InvalidIdentifierChar(c)) => Err(SqlSanitizeError::InvalidTableChar(c)),
    other => other,
  }
}

/// Double-quote a table name after validating it.
pub fn quote_identifier(name: &str) -> Result<String, SqlSanitizeError> {
  validate_table_name(name)?;
  Ok(format!("\"{name}\""))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_shadow_table_names_accepted() {
    for name in ["str_users", "hash_users_7", "zset_board", "_scratch", "Set_Tags"] {
      assert_eq!(validate_table_name(name), Ok(()), "{name}");
    }
  }

  #[test]
  fn test_bad_fragments_rejected() {
    assert_eq!(validate_identifier(""), Err(SqlSanitizeError::EmptyIdentifier));
    assert_eq!(
      validate_identifier("7up"),
      Err(SqlSanitizeError::InvalidIdentifierStart('7'))
    );
    assert_eq!(
      validate_identifier("ha-sh"),
      Err(SqlSanitizeError::InvalidIdentifierChar('-'))
    );
    assert_eq!(
      validate_identifier(&"b".repeat(64)),
      Err(SqlSanitizeError::IdentifierTooLong(64))
    );
  }

  #[test]
  fn test_quote_identifier() {
    assert_eq!(quote_identifier("lst_queue").unwrap(), "\"lst_queue\"");
    assert_eq!(
      quote_identifier("lst_q\"ueue"),
      Err(SqlSanitizeError::InvalidTableChar('"'))
    );
  }

  #[test]
  fn test_injection_shaped_buckets() {
    for name in ["set_a; DROP TABLE set_a;--", "hash_' OR '1'='1", "str_x/**/OR/**/1=1", "zset_b.c"] {
      assert!(validate_table_name(name).is_err(), "{name}");
    }
  }
}
