use async_trait::async_trait;
use rusqlite::types::{Value, ValueRef};
use tokio_rusqlite::Connection;

use super::backend::{DurableStore, Row, SqlDialect, SqlValue, Statement};
use crate::error::DurableError;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;
"#;

pub struct SqliteBackend {
  conn: Connection,
}

impl SqliteBackend {
  pub async fn new(path: &str) -> Result<Self, DurableError> {
    let conn = if path == ":memory:" {
      Connection::open_in_memory().await
    } else {
      Connection::open(path).await
    }
    .map_err(|e| DurableError::Connection(e.to_string()))?;

    // Apply performance pragmas
    conn
      .call(|conn| conn.execute_batch(PRAGMAS).map_err(|e| e.into()))
      .await
      .map_err(classify)?;

    Ok(Self { conn })
  }

  pub async fn in_memory() -> Result<Self, DurableError> {
    Self::new(":memory:").await
  }
}

fn to_value(v: SqlValue) -> Value {
  match v {
    SqlValue::Null => Value::Null,
    SqlValue::Integer(i) => Value::Integer(i),
    SqlValue::Real(f) => Value::Real(f),
    SqlValue::Text(s) => Value::Text(s),
  }
}

fn from_value_ref(v: ValueRef<'_>) -> SqlValue {
  match v {
    ValueRef::Null => SqlValue::Null,
    ValueRef::Integer(i) => SqlValue::Integer(i),
    ValueRef::Real(f) => SqlValue::Real(f),
    ValueRef::Text(t) | ValueRef::Blob(t) => {
      SqlValue::Text(String::from_utf8_lossy(t).into_owned())
    }
  }
}

/// Map SQLite failures onto the durable error taxonomy. SQLite reports both
/// conditions as a generic SQLITE_ERROR, so the message is what identifies them.
fn classify(err: tokio_rusqlite::Error) -> DurableError {
  match err {
    tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(_, Some(msg))) => {
      if let Some(table) = msg.strip_prefix("no such table: ") {
        DurableError::MissingTable(table.to_string())
      } else if msg.starts_with("table ") && msg.ends_with(" already exists") {
        DurableError::AlreadyExists(msg)
      } else {
        DurableError::Query(msg)
      }
    }
    tokio_rusqlite::Error::ConnectionClosed => {
      DurableError::Connection("connection closed".to_string())
    }
    other => DurableError::Query(other.to_string()),
  }
}

#[async_trait]
impl DurableStore for SqliteBackend {
  fn dialect(&self) -> SqlDialect {
    SqlDialect::Sqlite
  }

  async fn execute(&self, stmt: Statement) -> Result<u64, DurableError> {
    let Statement { sql, params } = stmt;
    let changed = self
      .conn
      .call(move |conn| {
        let params = params.into_iter().map(to_value);
        conn
          .execute(&sql, rusqlite::params_from_iter(params))
          .map_err(|e| e.into())
      })
      .await
      .map_err(classify)?;
    Ok(changed as u64)
  }

  async fn query(&self, stmt: Statement) -> Result<Vec<Row>, DurableError> {
    let Statement { sql, params } = stmt;
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        let width = stmt.column_count();
        let params = params.into_iter().map(to_value);
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
          let mut values = Vec::with_capacity(width);
          for i in 0..width {
            values.push(from_value_ref(row.get_ref(i)?));
          }
          out.push(Row(values));
        }
        Ok(out)
      })
      .await
      .map_err(classify)
  }

  async fn transaction(&self, stmts: Vec<Statement>) -> Result<(), DurableError> {
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        for Statement { sql, params } in stmts {
          let params = params.into_iter().map(to_value);
          tx.execute(&sql, rusqlite::params_from_iter(params))?;
        }
        // Dropping an uncommitted transaction rolls it back.
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(classify)
  }
}
