//! Error types shared by the cache, durable and sync layers

use thiserror::Error;

use crate::db::SqlSanitizeError;

/// Structural misconfiguration, raised when the engine is built.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("prefix for {kind} structures is empty")]
  EmptyPrefix { kind: String },

  #[error("prefix '{prefix}' is configured for both {first} and {second}")]
  DuplicatePrefix {
    prefix: String,
    first: String,
    second: String,
  },

  #[error("prefix '{prefix}' is not a valid table name fragment: {reason}")]
  InvalidPrefix { prefix: String, reason: String },

  #[error("unknown structure prefix '{0}'")]
  UnknownPrefix(String),

  #[error("missing credentials: {0}")]
  MissingCredentials(String),

  #[error("failed to load config: {0}")]
  Load(String),
}

/// Errors returned by a cache backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
  #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
  WrongType,

  #[error("OOM command not allowed when used memory > 'maxmemory'")]
  OutOfMemory,

  #[error("ERR {0}")]
  Command(String),

  #[error("cache connection error: {0}")]
  Connection(String),

  #[error("unexpected cache reply: {0}")]
  UnexpectedReply(String),
}

/// Errors returned by a durable (relational) backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DurableError {
  /// The queried table does not exist. Read paths treat this as "no data".
  #[error("table does not exist: {0}")]
  MissingTable(String),

  /// A concurrent `CREATE TABLE` won the race.
  #[error("table already exists: {0}")]
  AlreadyExists(String),

  #[error("durable query failed: {0}")]
  Query(String),

  #[error("durable connection error: {0}")]
  Connection(String),

  #[error(transparent)]
  Sanitize(#[from] SqlSanitizeError),
}

impl DurableError {
  pub fn is_missing_table(&self) -> bool {
    matches!(self, DurableError::MissingTable(_))
  }
}

/// Errors a caller of the command surface can observe.
///
/// Durable-side failures never show up here; they are published on the
/// failure channel instead.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
  #[error("ERR {0}")]
  Validation(String),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error("ERR index not found")]
  IndexNotFound,
}

impl SyncError {
  pub fn validation(msg: impl Into<String>) -> Self {
    SyncError::Validation(msg.into())
  }

  pub fn wrong_arity(cmd: &str) -> Self {
    SyncError::Validation(format!(
      "wrong number of arguments for '{}' command",
      cmd.to_lowercase()
    ))
  }
}

pub type SyncResult<T> = Result<T, SyncError>;
