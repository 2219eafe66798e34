use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use postgres_types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;

use super::backend::{DurableStore, Row, SqlDialect, SqlValue, Statement};
use crate::error::DurableError;

pub struct PostgresBackend {
  pool: Pool,
}

impl PostgresBackend {
  pub fn new(url: &str, max_connections: usize) -> Result<Self, DurableError> {
    let mut cfg = Config::new();
    cfg.url = Some(url.into());
    cfg.manager = Some(ManagerConfig {
      recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(max_connections.max(1)));
    let pool = cfg
      .create_pool(Some(Runtime::Tokio1), NoTls)
      .map_err(|e| DurableError::Connection(e.to_string()))?;
    Ok(Self { pool })
  }

  async fn client(&self) -> Result<deadpool_postgres::Object, DurableError> {
    self
      .pool
      .get()
      .await
      .map_err(|e| DurableError::Connection(e.to_string()))
  }
}

/// Map Postgres failures onto the durable error taxonomy by SQLSTATE.
fn classify(err: tokio_postgres::Error) -> DurableError {
  match err.code() {
    Some(code) if *code == SqlState::UNDEFINED_TABLE => DurableError::MissingTable(err.to_string()),
    // Concurrent CREATE TABLE IF NOT EXISTS can still collide on pg_type.
    Some(code) if *code == SqlState::DUPLICATE_TABLE || *code == SqlState::UNIQUE_VIOLATION => {
      if err.to_string().contains("pg_type") || *code == SqlState::DUPLICATE_TABLE {
        DurableError::AlreadyExists(err.to_string())
      } else {
        DurableError::Query(err.to_string())
      }
    }
    _ if err.is_closed() => DurableError::Connection(err.to_string()),
    _ => DurableError::Query(err.to_string()),
  }
}

/// Binds a [`SqlValue`], coercing numerics to whatever the server inferred
/// for the placeholder.
impl ToSql for SqlValue {
  fn to_sql(
    &self,
    ty: &Type,
    out: &mut postgres_types::private::BytesMut,
  ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
    match self {
      SqlValue::Null => Ok(IsNull::Yes),
      SqlValue::Text(s) => s.to_sql(ty, out),
      SqlValue::Integer(i) => match *ty {
        Type::INT2 => (*i as i16).to_sql(ty, out),
        Type::INT4 => (*i as i32).to_sql(ty, out),
        Type::FLOAT4 => (*i as f32).to_sql(ty, out),
        Type::FLOAT8 => (*i as f64).to_sql(ty, out),
        Type::TEXT | Type::VARCHAR => i.to_string().to_sql(ty, out),
        _ => i.to_sql(ty, out),
      },
      SqlValue::Real(f) => match *ty {
        Type::FLOAT4 => (*f as f32).to_sql(ty, out),
        Type::INT8 => (*f as i64).to_sql(ty, out),
        Type::TEXT | Type::VARCHAR => f.to_string().to_sql(ty, out),
        _ => f.to_sql(ty, out),
      },
    }
  }

  fn accepts(_ty: &Type) -> bool {
    true
  }

  to_sql_checked!();
}

fn read_row(row: &tokio_postgres::Row) -> Result<Row, tokio_postgres::Error> {
  let mut values = Vec::with_capacity(row.len());
  for (i, column) in row.columns().iter().enumerate() {
    let value = match *column.type_() {
      Type::BOOL => row
        .try_get::<_, Option<bool>>(i)?
        .map(|b| SqlValue::Integer(b as i64)),
      Type::INT2 => row
        .try_get::<_, Option<i16>>(i)?
        .map(|v| SqlValue::Integer(v as i64)),
      Type::INT4 => row
        .try_get::<_, Option<i32>>(i)?
        .map(|v| SqlValue::Integer(v as i64)),
      Type::INT8 => row.try_get::<_, Option<i64>>(i)?.map(SqlValue::Integer),
      Type::FLOAT4 => row
        .try_get::<_, Option<f32>>(i)?
        .map(|v| SqlValue::Real(v as f64)),
      Type::FLOAT8 => row.try_get::<_, Option<f64>>(i)?.map(SqlValue::Real),
      Type::TIMESTAMPTZ => row
        .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(i)?
        .map(|t| SqlValue::Text(t.to_rfc3339())),
      _ => row.try_get::<_, Option<String>>(i)?.map(SqlValue::Text),
    };
    values.push(value.unwrap_or(SqlValue::Null));
  }
  Ok(Row(values))
}

fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
  params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl DurableStore for PostgresBackend {
  fn dialect(&self) -> SqlDialect {
    SqlDialect::Postgres
  }

  async fn execute(&self, stmt: Statement) -> Result<u64, DurableError> {
    let client = self.client().await?;
    client
      .execute(stmt.sql.as_str(), &bind(&stmt.params))
      .await
      .map_err(classify)
  }

  async fn query(&self, stmt: Statement) -> Result<Vec<Row>, DurableError> {
    let client = self.client().await?;
    let rows = client
      .query(stmt.sql.as_str(), &bind(&stmt.params))
      .await
      .map_err(classify)?;
    rows
      .iter()
      .map(read_row)
      .collect::<Result<Vec<_>, _>>()
      .map_err(classify)
  }

  async fn transaction(&self, stmts: Vec<Statement>) -> Result<(), DurableError> {
    let mut client = self.client().await?;
    let tx = client.transaction().await.map_err(classify)?;
    for stmt in &stmts {
      // An early return drops `tx`, which rolls it back.
      tx.execute(stmt.sql.as_str(), &bind(&stmt.params))
        .await
        .map_err(classify)?;
    }
    tx.commit().await.map_err(classify)
  }
}
