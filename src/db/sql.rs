//! Statement builders.
//!
//! Pure text composition over validated identifiers. Column names are fixed
//! by the row shapes below, so only table names are caller-derived.

use super::backend::{SqlDialect, SqlValue, Statement};
use super::sanitize::quote_identifier;
use crate::error::DurableError;
use crate::keys::{StructureKind, EXPIRY_TABLE};

/// Row identity and payload columns for a structure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowShape {
  /// Unique column (conflict target for upserts)
  pub key: &'static str,
  /// Remaining payload column, if any
  pub value: Option<&'static str>,
}

pub fn row_shape(kind: StructureKind) -> RowShape {
  match kind {
    StructureKind::String => RowShape {
      key: "key",
      value: Some("value"),
    },
    StructureKind::List => RowShape {
      key: "sequence",
      value: Some("value"),
    },
    StructureKind::Set => RowShape {
      key: "member",
      value: None,
    },
    StructureKind::SortedSet => RowShape {
      key: "member",
      value: Some("score"),
    },
    StructureKind::Hash => RowShape {
      key: "field",
      value: Some("value"),
    },
  }
}

/// How an upsert treats a conflicting row's payload column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
  /// `col = excluded.col`
  Replace,
  /// `col = table.col + excluded.col`
  Add,
}

#[derive(Debug, Clone, Copy)]
pub struct SqlBuilder {
  dialect: SqlDialect,
}

impl SqlBuilder {
  pub fn new(dialect: SqlDialect) -> Self {
    Self { dialect }
  }

  pub fn dialect(&self) -> SqlDialect {
    self.dialect
  }

  pub fn quote(&self, table: &str) -> Result<String, DurableError> {
    Ok(quote_identifier(table)?)
  }

  pub fn ph(&self, n: usize) -> String {
    self.dialect.placeholder(n)
  }

  /// `(?1, ?2), (?3, ?4)` for `rows` tuples of `width` parameters
  pub fn build_values_clause(&self, rows: usize, width: usize) -> String {
    (0..rows)
      .map(|r| {
        let cols: Vec<String> = (0..width).map(|c| self.ph(r * width + c + 1)).collect();
        format!("({})", cols.join(", "))
      })
      .collect::<Vec<_>>()
      .join(", ")
  }

  pub fn create_table(&self, table: &str, kind: StructureKind) -> Result<Statement, DurableError> {
    let t = self.quote(table)?;
    let text = self.dialect.text_type();
    let float = self.dialect.float_type();
    let ts = self.dialect.timestamp_column();
    let columns = match kind {
      StructureKind::String => format!("key {text} PRIMARY KEY, value {text} NOT NULL"),
      StructureKind::List => format!("sequence {float} PRIMARY KEY, value {text} NOT NULL"),
      StructureKind::Set => format!("member {text} PRIMARY KEY"),
      StructureKind::SortedSet => format!("score {float} NOT NULL, member {text} PRIMARY KEY"),
      StructureKind::Hash => format!("field {text} PRIMARY KEY, value {text} NOT NULL"),
    };
    Ok(Statement::bare(format!(
      "CREATE TABLE IF NOT EXISTS {t} ({columns}, created_at {ts}, updated_at {ts})"
    )))
  }

  pub fn create_expiry_table(&self) -> Result<Statement, DurableError> {
    let t = self.quote(EXPIRY_TABLE)?;
    let text = self.dialect.text_type();
    let int = self.dialect.integer_type();
    let ts = self.dialect.timestamp_column();
    Ok(Statement::bare(format!(
      "CREATE TABLE IF NOT EXISTS {t} (key {text} PRIMARY KEY, expiry_timestamp {int} NOT NULL, created_at {ts}, updated_at {ts})"
    )))
  }

  pub fn drop_table(&self, table: &str) -> Result<Statement, DurableError> {
    Ok(Statement::bare(format!(
      "DROP TABLE IF EXISTS {}",
      self.quote(table)?
    )))
  }

  pub fn rename_table(&self, from: &str, to: &str) -> Result<Statement, DurableError> {
    Ok(Statement::bare(format!(
      "ALTER TABLE {} RENAME TO {}",
      self.quote(from)?,
      self.quote(to)?
    )))
  }

  /// `SELECT EXISTS(SELECT 1 FROM t)`; one row, one 0/1 column.
  pub fn has_rows(&self, table: &str) -> Result<Statement, DurableError> {
    Ok(Statement::bare(format!(
      "SELECT EXISTS(SELECT 1 FROM {}) AS present",
      self.quote(table)?
    )))
  }

  pub fn build_insert(
    &self,
    table: &str,
    columns: &[&str],
    rows: Vec<Vec<SqlValue>>,
  ) -> Result<Statement, DurableError> {
    let t = self.quote(table)?;
    let values = self.build_values_clause(rows.len(), columns.len());
    let params = rows.into_iter().flatten().collect();
    Ok(Statement::new(
      format!("INSERT INTO {t} ({}) VALUES {values}", columns.join(", ")),
      params,
    ))
  }

  /// The target table is named explicitly in additive expressions; Postgres
  /// rejects a bare column there as ambiguous with `excluded`.
  pub fn build_on_conflict(
    &self,
    quoted_table: &str,
    conflict: &str,
    update: &[(&str, OnConflict)],
  ) -> String {
    let mut sets: Vec<String> = update
      .iter()
      .map(|(col, mode)| match mode {
        OnConflict::Replace => format!("{col} = excluded.{col}"),
        OnConflict::Add => format!("{col} = {quoted_table}.{col} + excluded.{col}"),
      })
      .collect();
    sets.push("updated_at = CURRENT_TIMESTAMP".to_string());
    format!(" ON CONFLICT ({conflict}) DO UPDATE SET {}", sets.join(", "))
  }

  /// Multi-row insert-or-update on the kind's unique column.
  pub fn build_upsert(
    &self,
    table: &str,
    kind: StructureKind,
    rows: Vec<Vec<SqlValue>>,
    mode: OnConflict,
  ) -> Result<Statement, DurableError> {
    let shape = row_shape(kind);
    let columns = upsert_columns(kind);
    let mut stmt = self.build_insert(table, &columns, rows)?;
    let updates: Vec<(&str, OnConflict)> = shape.value.map(|v| (v, mode)).into_iter().collect();
    let clause = self.build_on_conflict(&self.quote(table)?, shape.key, &updates);
    stmt.sql.push_str(&clause);
    Ok(stmt)
  }

  pub fn build_select(
    &self,
    table: &str,
    columns: &[&str],
    filter: Option<&str>,
    params: Vec<SqlValue>,
  ) -> Result<Statement, DurableError> {
    let t = self.quote(table)?;
    let mut sql = format!("SELECT {} FROM {t}", columns.join(", "));
    if let Some(f) = filter {
      sql.push_str(" WHERE ");
      sql.push_str(f);
    }
    Ok(Statement::new(sql, params))
  }

  /// `col IN (?1, ?2, ...)` starting at parameter `start`
  pub fn build_in(&self, column: &str, start: usize, count: usize) -> String {
    let list: Vec<String> = (0..count).map(|i| self.ph(start + i)).collect();
    format!("{column} IN ({})", list.join(", "))
  }

  pub fn build_delete_in(
    &self,
    table: &str,
    column: &str,
    values: Vec<SqlValue>,
  ) -> Result<Statement, DurableError> {
    let t = self.quote(table)?;
    let filter = self.build_in(column, 1, values.len());
    Ok(Statement::new(
      format!("DELETE FROM {t} WHERE {filter}"),
      values,
    ))
  }

  /// `UPDATE t SET col = ?1, updated_at = CURRENT_TIMESTAMP WHERE key_col = ?2`
  pub fn build_update(
    &self,
    table: &str,
    column: &str,
    key_column: &str,
    value: SqlValue,
    key: SqlValue,
  ) -> Result<Statement, DurableError> {
    let t = self.quote(table)?;
    Ok(Statement::new(
      format!(
        "UPDATE {t} SET {column} = {}, updated_at = CURRENT_TIMESTAMP WHERE {key_column} = {}",
        self.ph(1),
        self.ph(2)
      ),
      vec![value, key],
    ))
  }
}

/// Insert column order per kind; upsert rows are built in this order.
pub fn upsert_columns(kind: StructureKind) -> Vec<&'static str> {
  match kind {
    StructureKind::String => vec!["key", "value"],
    StructureKind::List => vec!["sequence", "value"],
    StructureKind::Set => vec!["member"],
    StructureKind::SortedSet => vec!["score", "member"],
    StructureKind::Hash => vec!["field", "value"],
  }
}
