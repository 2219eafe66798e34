//! DEL / EXISTS / RENAME / EXPIRE
//!
//! Rename is the one multi-step durable protocol: move the row or table,
//! rekey the string row, relink the expiry record. Steps run in order and a
//! failure unwinds the completed ones, newest first.

use std::time::Duration;

use chrono::Utc;

use super::populate;
use super::SyncContext;
use crate::cache::CacheCommand;
use crate::db::{OnConflict, SqlBuilder, SqlValue, Statement};
use crate::error::{DurableError, SyncError, SyncResult};
use crate::keys::{MappedKey, StructureKind, EXPIRY_TABLE};

pub struct KeyspaceCommands<'a> {
  ctx: &'a SyncContext,
}

/// Durable rename steps that completed and may need reversing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenameStep {
  MovedRow,
  RekeyedRow,
  RenamedTable,
}

impl<'a> KeyspaceCommands<'a> {
  pub(crate) fn new(ctx: &'a SyncContext) -> Self {
    Self { ctx }
  }

  /// Delete keys from the cache, then drop their durable state in the
  /// background. Returns the number of cache keys removed.
  pub async fn del(&self, logical: &[String]) -> SyncResult<i64> {
    if logical.is_empty() {
      return Err(SyncError::wrong_arity("del"));
    }
    let keys = logical
      .iter()
      .map(|k| self.ctx.keys.parse(k))
      .collect::<SyncResult<Vec<_>>>()?;
    let removed = self
      .ctx
      .cache(CacheCommand::Del {
        keys: keys.iter().map(|k| k.cache_key.clone()).collect(),
      })
      .await?
      .into_integer()?;
    for key in keys {
      spawn_delete(self.ctx, key);
    }
    Ok(removed)
  }

  pub async fn exists(&self, logical: &str) -> SyncResult<i64> {
    let key = self.ctx.keys.parse(logical)?;
    if self.ctx.cache_exists(&key.cache_key).await? {
      return Ok(1);
    }
    let present = match key.kind {
      StructureKind::String => populate::load(self.ctx, &key).await.is_some(),
      _ => self
        .ctx
        .read(&key, |sql| sql.has_rows(&key.table))
        .await
        .first()
        .and_then(|r| r.integer(0))
        .is_some_and(|n| n != 0),
    };
    if !present {
      return Ok(0);
    }
    populate::backfill_point(self.ctx, &key, Vec::new());
    Ok(1)
  }

  pub async fn rename(&self, old: &str, new: &str) -> SyncResult<()> {
    let from = self.ctx.keys.parse(old)?;
    let to = self.ctx.keys.parse(new)?;
    if from.prefix != to.prefix {
      return Err(SyncError::validation(format!(
        "cannot rename '{}' to '{}': prefixes differ",
        old, new
      )));
    }
    if from.has_identifier() != to.has_identifier() {
      return Err(SyncError::validation(format!(
        "cannot rename '{}' to '{}': key shapes differ",
        old, new
      )));
    }

    populate::rehydrate(self.ctx, &from).await?;
    self
      .ctx
      .cache(CacheCommand::Rename {
        from: from.cache_key.clone(),
        to: to.cache_key.clone(),
      })
      .await?;
    if from.cache_key == to.cache_key {
      return Ok(());
    }

    let ctx = self.ctx.clone();
    self.ctx.tasks.spawn(async move {
      let mut done = Vec::new();
      if let Err(err) = rename_durable(&ctx, &from, &to, &mut done).await {
        ctx.failures.durable(&from.cache_key, err);
        ctx
          .compensate(
            &to.cache_key,
            vec![CacheCommand::Rename {
              from: to.cache_key.clone(),
              to: from.cache_key.clone(),
            }],
          )
          .await;
        for step in done.into_iter().rev() {
          if let Err(err) = reverse_step(&ctx, &from, &to, step).await {
            ctx.failures.durable(&from.cache_key, err);
          }
        }
        return;
      }
      if from.kind == StructureKind::String && from.table != to.table {
        if let Err(err) = ctx.schema.drop_table_if_empty(&from.table).await {
          ctx.failures.durable(&from.cache_key, err);
        }
      }
    });
    Ok(())
  }

  /// Set a TTL in seconds. The cache TTL is authoritative; the expiry table
  /// only records the deadline.
  pub async fn expire(&self, logical: &str, seconds: u64) -> SyncResult<i64> {
    let key = self.ctx.keys.parse(logical)?;
    let deadline = i64::try_from(seconds)
      .ok()
      .and_then(|secs| Utc::now().timestamp().checked_add(secs))
      .ok_or_else(|| SyncError::validation("invalid expire time in 'expire' command"))?;
    populate::rehydrate(self.ctx, &key).await?;
    let applied = self
      .ctx
      .cache(CacheCommand::Expire {
        key: key.cache_key.clone(),
        ttl: Duration::from_secs(seconds),
      })
      .await?
      .into_integer()?;
    if applied == 0 {
      return Ok(0);
    }
    if seconds == 0 {
      // EXPIRE 0 deleted the cache key outright.
      spawn_delete(self.ctx, key);
      return Ok(applied);
    }

    let ctx = self.ctx.clone();
    self.ctx.tasks.spawn(async move {
      let result = async {
        ctx.schema.ensure_expiry_table().await?;
        ctx
          .writer
          .execute(upsert_expiry(&ctx.sql, &key.cache_key, deadline)?)
          .await?;
        Ok::<_, DurableError>(())
      }
      .await;
      if let Err(err) = result {
        ctx.failures.durable(&key.cache_key, err);
      }
    });
    Ok(applied)
  }
}

fn spawn_delete(ctx: &SyncContext, key: MappedKey) {
  let ctx_owned = ctx.clone();
  ctx.tasks.spawn(async move {
    let ctx = ctx_owned;
    if let Err(err) = delete_durable(&ctx, &key).await {
      ctx.failures.durable(&key.cache_key, err);
    }
  });
}

async fn delete_durable(ctx: &SyncContext, key: &MappedKey) -> Result<(), DurableError> {
  match key.kind {
    StructureKind::String => {
      let id = SqlValue::from(key.row_key().unwrap_or_default());
      match ctx
        .writer
        .execute(ctx.sql.build_delete_in(&key.table, "key", vec![id])?)
        .await
      {
        Ok(_) | Err(DurableError::MissingTable(_)) => {}
        Err(e) => return Err(e),
      }
      ctx.schema.drop_table_if_empty(&key.table).await?;
    }
    _ => ctx.schema.drop_table(&key.table).await?,
  }
  let forget = ctx.sql.build_delete_in(
    EXPIRY_TABLE,
    "key",
    vec![SqlValue::from(key.cache_key.as_str())],
  )?;
  tolerate_missing(ctx.writer.execute(forget).await.map(|_| ()))
}

fn tolerate_missing(result: Result<(), DurableError>) -> Result<(), DurableError> {
  match result {
    Err(DurableError::MissingTable(_)) => Ok(()),
    other => other,
  }
}

async fn rename_durable(
  ctx: &SyncContext,
  from: &MappedKey,
  to: &MappedKey,
  done: &mut Vec<RenameStep>,
) -> Result<(), DurableError> {
  let sql = &ctx.sql;
  if from.table != to.table {
    if from.kind == StructureKind::String {
      ctx.schema.ensure_table(&to.table, StructureKind::String).await?;
      let id = from.row_key().unwrap_or_default();
      match ctx
        .writer
        .transaction(move_row(sql, &from.table, &to.table, id)?)
        .await
      {
        Ok(()) => done.push(RenameStep::MovedRow),
        Err(DurableError::MissingTable(_)) => {}
        Err(e) => return Err(e),
      }
    } else {
      let stmts = vec![sql.drop_table(&to.table)?, sql.rename_table(&from.table, &to.table)?];
      match ctx.writer.transaction(stmts).await {
        Ok(()) => done.push(RenameStep::RenamedTable),
        // Nothing durable to carry over; the destination's old data is stale.
        Err(DurableError::MissingTable(_)) => ctx.schema.drop_table(&to.table).await?,
        Err(e) => return Err(e),
      }
    }
  }

  if from.kind == StructureKind::String && from.identifier != to.identifier {
    let old_id = from.row_key().unwrap_or_default();
    let new_id = to.row_key().unwrap_or_default();
    match ctx
      .writer
      .transaction(rekey_row(sql, &to.table, "key", old_id, new_id)?)
      .await
    {
      Ok(()) => done.push(RenameStep::RekeyedRow),
      Err(DurableError::MissingTable(_)) => {}
      Err(e) => return Err(e),
    }
  }

  // Runs last, so a relink that went through never needs undoing.
  let relink = rekey_row(sql, EXPIRY_TABLE, "key", &from.cache_key, &to.cache_key)?;
  tolerate_missing(ctx.writer.transaction(relink).await)?;

  tracing::debug!("Renamed durable state {} -> {}", from.cache_key, to.cache_key);
  Ok(())
}

async fn reverse_step(
  ctx: &SyncContext,
  from: &MappedKey,
  to: &MappedKey,
  step: RenameStep,
) -> Result<(), DurableError> {
  let sql = &ctx.sql;
  match step {
    RenameStep::MovedRow => {
      ctx.schema.ensure_table(&from.table, StructureKind::String).await?;
      let id = from.row_key().unwrap_or_default();
      ctx
        .writer
        .transaction(move_row(sql, &to.table, &from.table, id)?)
        .await
    }
    RenameStep::RekeyedRow => {
      let old_id = from.row_key().unwrap_or_default();
      let new_id = to.row_key().unwrap_or_default();
      let stmt = sql.build_update(
        &to.table,
        "key",
        "key",
        SqlValue::from(old_id),
        SqlValue::from(new_id),
      )?;
      ctx.writer.execute(stmt).await.map(|_| ())
    }
    RenameStep::RenamedTable => {
      ctx
        .writer
        .execute(sql.rename_table(&to.table, &from.table)?)
        .await
        .map(|_| ())
    }
  }
}

/// Copy string row `id` from `src` into `dst` (overwriting) and delete it
/// from `src`.
fn move_row(sql: &SqlBuilder, src: &str, dst: &str, id: &str) -> Result<Vec<Statement>, DurableError> {
  let s = sql.quote(src)?;
  let d = sql.quote(dst)?;
  let copy = Statement::new(
    format!(
      "INSERT INTO {d} (key, value) SELECT key, value FROM {s} WHERE key = {}{}",
      sql.ph(1),
      sql.build_on_conflict(&d, "key", &[("value", OnConflict::Replace)])
    ),
    vec![SqlValue::from(id)],
  );
  let delete = sql.build_delete_in(src, "key", vec![SqlValue::from(id)])?;
  Ok(vec![copy, delete])
}

/// Move the row keyed `old` to `new`, replacing whatever held `new`.
fn rekey_row(
  sql: &SqlBuilder,
  table: &str,
  column: &str,
  old: &str,
  new: &str,
) -> Result<Vec<Statement>, DurableError> {
  Ok(vec![
    sql.build_delete_in(table, column, vec![SqlValue::from(new)])?,
    sql.build_update(table, column, column, SqlValue::from(new), SqlValue::from(old))?,
  ])
}

fn upsert_expiry(sql: &SqlBuilder, cache_key: &str, deadline: i64) -> Result<Statement, DurableError> {
  let mut stmt = sql.build_insert(
    EXPIRY_TABLE,
    &["key", "expiry_timestamp"],
    vec![vec![SqlValue::from(cache_key), SqlValue::Integer(deadline)]],
  )?;
  let clause = sql.build_on_conflict(
    &sql.quote(EXPIRY_TABLE)?,
    "key",
    &[("expiry_timestamp", OnConflict::Replace)],
  );
  stmt.sql.push_str(&clause);
  Ok(stmt)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::SqlDialect;

  #[test]
  fn test_move_row_copies_then_deletes() {
    let sql = SqlBuilder::new(SqlDialect::Sqlite);
    let stmts = move_row(&sql, "str_users", "str_people", "42").unwrap();
    assert_eq!(stmts.len(), 2);
    assert!(stmts[0].sql.starts_with("INSERT INTO \"str_people\" (key, value) SELECT key, value FROM \"str_users\""));
    assert!(stmts[0].sql.contains("ON CONFLICT (key) DO UPDATE SET value = excluded.value"));
    assert_eq!(stmts[1].sql, "DELETE FROM \"str_users\" WHERE key IN (?1)");
  }

  #[test]
  fn test_rekey_clears_destination_first() {
    let sql = SqlBuilder::new(SqlDialect::Postgres);
    let stmts = rekey_row(&sql, EXPIRY_TABLE, "key", "hash:a", "hash:b").unwrap();
    assert_eq!(stmts[0].params, vec![SqlValue::from("hash:b")]);
    assert_eq!(
      stmts[1].params,
      vec![SqlValue::from("hash:b"), SqlValue::from("hash:a")]
    );
  }

  #[test]
  fn test_expiry_upsert_replaces_deadline() {
    let sql = SqlBuilder::new(SqlDialect::Sqlite);
    let stmt = upsert_expiry(&sql, "hash:users", 1_700_000_000).unwrap();
    assert!(stmt.sql.contains("ON CONFLICT (key) DO UPDATE SET expiry_timestamp = excluded.expiry_timestamp"));
    assert_eq!(stmt.params[1], SqlValue::Integer(1_700_000_000));
  }
}
