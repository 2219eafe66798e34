//! Lazy shadow-table provisioning

use std::sync::Arc;

use crate::db::{DurableStore, SqlBuilder};
use crate::error::DurableError;
use crate::keys::StructureKind;

#[derive(Clone)]
pub(crate) struct SchemaProvisioner {
  writer: Arc<dyn DurableStore>,
  sql: SqlBuilder,
}

impl SchemaProvisioner {
  pub fn new(writer: Arc<dyn DurableStore>) -> Self {
    let sql = SqlBuilder::new(writer.dialect());
    Self { writer, sql }
  }

  /// `CREATE TABLE IF NOT EXISTS`; losing a creation race still counts as success.
  pub async fn ensure_table(&self, table: &str, kind: StructureKind) -> Result<(), DurableError> {
    match self.writer.execute(self.sql.create_table(table, kind)?).await {
      Ok(_) | Err(DurableError::AlreadyExists(_)) => Ok(()),
      Err(e) => Err(e),
    }
  }

  pub async fn ensure_expiry_table(&self) -> Result<(), DurableError> {
    match self.writer.execute(self.sql.create_expiry_table()?).await {
      Ok(_) | Err(DurableError::AlreadyExists(_)) => Ok(()),
      Err(e) => Err(e),
    }
  }

  /// Drop `table` when it holds no rows. Returns whether it was dropped.
  ///
  /// A row inserted between the check and the drop is lost with the table.
  pub async fn drop_table_if_empty(&self, table: &str) -> Result<bool, DurableError> {
    let rows = match self.writer.query(self.sql.has_rows(table)?).await {
      Ok(rows) => rows,
      Err(DurableError::MissingTable(_)) => return Ok(false),
      Err(e) => return Err(e),
    };
    let present = rows.first().and_then(|r| r.integer(0)).unwrap_or(0) != 0;
    if present {
      return Ok(false);
    }
    self.drop_table(table).await?;
    tracing::debug!("Dropped empty shadow table {}", table);
    Ok(true)
  }

  pub async fn drop_table(&self, table: &str) -> Result<(), DurableError> {
    self.writer.execute(self.sql.drop_table(table)?).await?;
    Ok(())
  }
}
