//! List index and sorted-set rank emulation over unordered tables
//!
//! List rows carry a `sequence`, ascending from head to tail. Positions are
//! computed with `ROW_NUMBER()`: ascending order numbered from 0 for
//! non-negative indices, descending order numbered -1, -2, ... for negative
//! ones.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

use super::SyncContext;
use crate::cache::{CacheCommand, InsertPosition};
use crate::db::{SqlBuilder, SqlValue, Statement};
use crate::error::{DurableError, SyncResult};
use crate::keys::MappedKey;

/// Monotonic microsecond clock for list sequences
pub(crate) struct SequenceClock {
  last: AtomicI64,
}

impl SequenceClock {
  pub fn new() -> Self {
    Self {
      last: AtomicI64::new(0),
    }
  }

  /// Reserve `n` consecutive ticks, returning the first. Ticks follow wall
  /// time but never repeat, even if the clock steps back.
  pub fn reserve(&self, n: usize) -> i64 {
    let n = n.max(1) as i64;
    let mut prev = self.last.load(Ordering::Relaxed);
    loop {
      let base = Utc::now().timestamp_micros().max(prev + 1);
      match self
        .last
        .compare_exchange_weak(prev, base + n - 1, Ordering::AcqRel, Ordering::Relaxed)
      {
        Ok(_) => return base,
        Err(actual) => prev = actual,
      }
    }
  }

  /// Sequences for the values of one LPUSH, in argument order. Later values
  /// land nearer the head, so they get smaller sequences.
  pub fn push_sequences(&self, count: usize) -> Vec<f64> {
    let base = self.reserve(count);
    (0..count as i64).map(|j| -((base + j) as f64)).collect()
  }
}

fn position_expr(index: i64) -> &'static str {
  if index >= 0 {
    "ROW_NUMBER() OVER (ORDER BY sequence ASC) - 1"
  } else {
    "-ROW_NUMBER() OVER (ORDER BY sequence DESC)"
  }
}

/// `SELECT value` of the list row at `index`
pub(crate) fn index_query(sql: &SqlBuilder, table: &str, index: i64) -> Result<Statement, DurableError> {
  let t = sql.quote(table)?;
  Ok(Statement::new(
    format!(
      "SELECT value FROM (SELECT value, {} AS pos FROM {t}) AS ranked WHERE pos = {}",
      position_expr(index),
      sql.ph(1)
    ),
    vec![SqlValue::Integer(index)],
  ))
}

/// Overwrite the value of the list row at `index`
pub(crate) fn set_at_index(
  sql: &SqlBuilder,
  table: &str,
  index: i64,
  value: String,
) -> Result<Statement, DurableError> {
  let t = sql.quote(table)?;
  Ok(Statement::new(
    format!(
      "UPDATE {t} SET value = {}, updated_at = CURRENT_TIMESTAMP WHERE sequence = \
       (SELECT sequence FROM (SELECT sequence, {} AS pos FROM {t}) AS ranked WHERE pos = {})",
      sql.ph(1),
      position_expr(index),
      sql.ph(2)
    ),
    vec![SqlValue::Text(value), SqlValue::Integer(index)],
  ))
}

/// Delete the tail row (greatest sequence)
pub(crate) fn pop_tail(sql: &SqlBuilder, table: &str) -> Result<Statement, DurableError> {
  let t = sql.quote(table)?;
  Ok(Statement::bare(format!(
    "DELETE FROM {t} WHERE sequence = (SELECT MAX(sequence) FROM {t})"
  )))
}

/// 0-based rank of `member` ordered by (score, member)
pub(crate) fn rank_query(sql: &SqlBuilder, table: &str, member: &str) -> Result<Statement, DurableError> {
  let t = sql.quote(table)?;
  Ok(Statement::new(
    format!(
      "SELECT pos FROM (SELECT member, ROW_NUMBER() OVER (ORDER BY score ASC, member ASC) - 1 AS pos FROM {t}) AS ranked WHERE member = {}",
      sql.ph(1)
    ),
    vec![SqlValue::from(member)],
  ))
}

/// Value at `index` according to the durable mirror
pub(crate) async fn durable_index(ctx: &SyncContext, key: &MappedKey, index: i64) -> Option<String> {
  let rows = ctx
    .read(key, |sql| index_query(sql, &key.table, index))
    .await;
  rows.first().and_then(|r| r.text(0))
}

/// Rank of `member` according to the durable mirror
pub(crate) async fn durable_rank(ctx: &SyncContext, key: &MappedKey, member: &str) -> Option<i64> {
  let rows = ctx
    .read(key, |sql| rank_query(sql, &key.table, member))
    .await;
  rows.first().and_then(|r| r.integer(0))
}

/// Bring the cached list in line with the durable rows (head first).
///
/// Position by position: an equal value is left alone, a different value
/// gets the durable one inserted before it, and past the cached tail the
/// durable value is appended.
///
/// `LINSERT` finds its pivot by value. When the cached list repeats the
/// value at the mismatched position, the insert lands before its first
/// occurrence, which may be earlier than `pos`.
pub(crate) async fn reconcile_list(
  ctx: &SyncContext,
  key: &MappedKey,
  durable: Vec<String>,
) -> SyncResult<()> {
  for (pos, value) in durable.into_iter().enumerate() {
    let cached = ctx
      .cache(CacheCommand::LIndex {
        key: key.cache_key.clone(),
        index: pos as i64,
      })
      .await?
      .into_opt_string()?;
    match cached {
      Some(current) if current == value => {}
      Some(current) => {
        ctx
          .cache(CacheCommand::LInsert {
            key: key.cache_key.clone(),
            position: InsertPosition::Before,
            pivot: current,
            value,
          })
          .await?;
      }
      None => {
        ctx
          .cache(CacheCommand::RPush {
            key: key.cache_key.clone(),
            values: vec![value],
          })
          .await?;
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::SqlDialect;

  #[test]
  fn test_sequences_decrease_across_pushes() {
    let clock = SequenceClock::new();
    let first = clock.push_sequences(3);
    let second = clock.push_sequences(1);
    assert!(first[0] > first[1] && first[1] > first[2]);
    assert!(first[2] > second[0]);
  }

  #[test]
  fn test_reserve_never_repeats() {
    let clock = SequenceClock::new();
    let a = clock.reserve(5);
    let b = clock.reserve(1);
    assert!(b >= a + 5);
  }

  #[test]
  fn test_negative_index_uses_descending_numbering() {
    let sql = SqlBuilder::new(SqlDialect::Sqlite);
    let stmt = index_query(&sql, "lst_queue", -1).unwrap();
    assert!(stmt.sql.contains("-ROW_NUMBER() OVER (ORDER BY sequence DESC)"));
    assert_eq!(stmt.params, vec![SqlValue::Integer(-1)]);
    let stmt = index_query(&sql, "lst_queue", 0).unwrap();
    assert!(stmt.sql.contains("ROW_NUMBER() OVER (ORDER BY sequence ASC) - 1"));
  }

  #[test]
  fn test_rank_orders_by_score_then_member() {
    let sql = SqlBuilder::new(SqlDialect::Postgres);
    let stmt = rank_query(&sql, "zset_board", "krull").unwrap();
    assert!(stmt.sql.contains("ORDER BY score ASC, member ASC"));
    assert!(stmt.sql.ends_with("WHERE member = $1"));
  }
}
