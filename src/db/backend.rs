use async_trait::async_trait;

use crate::error::DurableError;

/// SQL dialect for statement generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
  Postgres,
  Sqlite,
}

impl SqlDialect {
  /// Positional parameter marker, 1-based
  pub fn placeholder(&self, n: usize) -> String {
    match self {
      Self::Postgres => format!("${}", n),
      Self::Sqlite => format!("?{}", n),
    }
  }

  pub fn text_type(&self) -> &'static str {
    "TEXT"
  }

  pub fn float_type(&self) -> &'static str {
    match self {
      Self::Postgres => "DOUBLE PRECISION",
      Self::Sqlite => "REAL",
    }
  }

  pub fn integer_type(&self) -> &'static str {
    match self {
      Self::Postgres => "BIGINT",
      Self::Sqlite => "INTEGER",
    }
  }

  /// Column definition for `created_at` / `updated_at`
  pub fn timestamp_column(&self) -> &'static str {
    match self {
      Self::Postgres => "TIMESTAMPTZ NOT NULL DEFAULT NOW()",
      Self::Sqlite => "TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP",
    }
  }
}

/// A bound parameter or a fetched column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
  Null,
  Integer(i64),
  Real(f64),
  Text(String),
}

impl SqlValue {
  pub fn as_text(&self) -> Option<String> {
    match self {
      SqlValue::Text(s) => Some(s.clone()),
      SqlValue::Integer(i) => Some(i.to_string()),
      SqlValue::Real(f) => Some(f.to_string()),
      SqlValue::Null => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      SqlValue::Real(f) => Some(*f),
      SqlValue::Integer(i) => Some(*i as f64),
      SqlValue::Text(s) => s.parse().ok(),
      SqlValue::Null => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      SqlValue::Integer(i) => Some(*i),
      SqlValue::Real(f) => Some(*f as i64),
      SqlValue::Text(s) => s.parse().ok(),
      SqlValue::Null => None,
    }
  }
}

impl From<&str> for SqlValue {
  fn from(s: &str) -> Self {
    SqlValue::Text(s.to_string())
  }
}

impl From<String> for SqlValue {
  fn from(s: String) -> Self {
    SqlValue::Text(s)
  }
}

impl From<i64> for SqlValue {
  fn from(i: i64) -> Self {
    SqlValue::Integer(i)
  }
}

impl From<f64> for SqlValue {
  fn from(f: f64) -> Self {
    SqlValue::Real(f)
  }
}

/// One fetched row, columns in select order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
  pub fn text(&self, idx: usize) -> Option<String> {
    self.0.get(idx).and_then(SqlValue::as_text)
  }

  pub fn float(&self, idx: usize) -> Option<f64> {
    self.0.get(idx).and_then(SqlValue::as_f64)
  }

  pub fn integer(&self, idx: usize) -> Option<i64> {
    self.0.get(idx).and_then(SqlValue::as_i64)
  }
}

/// SQL text plus its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
  pub sql: String,
  pub params: Vec<SqlValue>,
}

impl Statement {
  pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
    Self {
      sql: sql.into(),
      params,
    }
  }

  pub fn bare(sql: impl Into<String>) -> Self {
    Self::new(sql, Vec::new())
  }
}

/// Abstract durable (relational) backend
///
/// Implementations must classify "table does not exist" as
/// [`DurableError::MissingTable`] and "table already exists" as
/// [`DurableError::AlreadyExists`].
#[async_trait]
pub trait DurableStore: Send + Sync {
  fn dialect(&self) -> SqlDialect;

  /// Run a statement that returns no rows; yields the affected row count.
  async fn execute(&self, stmt: Statement) -> Result<u64, DurableError>;

  async fn query(&self, stmt: Statement) -> Result<Vec<Row>, DurableError>;

  /// Run statements in order inside one transaction, rolling back on the
  /// first failure.
  async fn transaction(&self, stmts: Vec<Statement>) -> Result<(), DurableError>;
}
