//! Read-through population
//!
//! A cold structure is always restored whole. Writing a single field or
//! member into a missing aggregate would leave a partial value that later
//! whole-structure reads serve as complete.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::SyncContext;
use crate::cache::{CacheCommand, CacheValue};
use crate::db::SqlValue;
use crate::error::{SyncError, SyncResult};
use crate::keys::{MappedKey, StructureKind};

/// Load a whole structure from its shadow table. `None` when there is no
/// durable data.
pub(crate) async fn load(ctx: &SyncContext, key: &MappedKey) -> Option<CacheValue> {
  let value = match key.kind {
    StructureKind::String => {
      let id = key.row_key().unwrap_or_default().to_string();
      let rows = ctx
        .read(key, |sql| {
          sql.build_select(
            &key.table,
            &["value"],
            Some(&format!("key = {}", sql.ph(1))),
            vec![SqlValue::Text(id)],
          )
        })
        .await;
      CacheValue::String(rows.first()?.text(0)?)
    }
    StructureKind::List => {
      let rows = ctx
        .read(key, |sql| {
          let mut stmt = sql.build_select(&key.table, &["value"], None, Vec::new())?;
          stmt.sql.push_str(" ORDER BY sequence ASC");
          Ok(stmt)
        })
        .await;
      let values: VecDeque<String> = rows.iter().filter_map(|r| r.text(0)).collect();
      CacheValue::List(values)
    }
    StructureKind::Set => {
      let rows = ctx
        .read(key, |sql| {
          sql.build_select(&key.table, &["member"], None, Vec::new())
        })
        .await;
      let members: BTreeSet<String> = rows.iter().filter_map(|r| r.text(0)).collect();
      CacheValue::Set(members)
    }
    StructureKind::SortedSet => {
      let rows = ctx
        .read(key, |sql| {
          sql.build_select(&key.table, &["member", "score"], None, Vec::new())
        })
        .await;
      let members: BTreeMap<String, f64> = rows
        .iter()
        .filter_map(|r| Some((r.text(0)?, r.float(1)?)))
        .collect();
      CacheValue::SortedSet(members)
    }
    StructureKind::Hash => {
      let rows = ctx
        .read(key, |sql| {
          sql.build_select(&key.table, &["field", "value"], None, Vec::new())
        })
        .await;
      let fields: BTreeMap<String, String> = rows
        .iter()
        .filter_map(|r| Some((r.text(0)?, r.text(1)?)))
        .collect();
      CacheValue::Hash(fields)
    }
  };
  (!value.is_empty()).then_some(value)
}

/// Cache commands that recreate `value` under `cache_key`
pub(crate) fn restore_commands(cache_key: &str, value: CacheValue) -> Vec<CacheCommand> {
  let key = cache_key.to_string();
  let cmd = match value {
    CacheValue::String(value) => CacheCommand::Set {
      key,
      value,
      nx: true,
    },
    CacheValue::List(values) => CacheCommand::RPush {
      key,
      values: values.into_iter().collect(),
    },
    CacheValue::Set(members) => CacheCommand::SAdd {
      key,
      members: members.into_iter().collect(),
    },
    CacheValue::SortedSet(members) => CacheCommand::ZAdd {
      key,
      members: members.into_iter().map(|(m, s)| (s, m)).collect(),
      nx: true,
    },
    CacheValue::Hash(fields) => CacheCommand::HSet {
      key,
      pairs: fields.into_iter().collect(),
    },
  };
  vec![cmd]
}

/// Restore a cold key from durable storage before a command that needs it
/// in the cache. Returns whether anything was restored.
pub(crate) async fn rehydrate(ctx: &SyncContext, key: &MappedKey) -> SyncResult<bool> {
  if ctx.cache_exists(&key.cache_key).await? {
    return Ok(false);
  }
  let Some(value) = load(ctx, key).await else {
    return Ok(false);
  };
  ctx
    .cache_atomic(restore_commands(&key.cache_key, value))
    .await?;
  tracing::debug!("Rehydrated {} from {}", key.cache_key, key.table);
  Ok(true)
}

/// Fire-and-forget cache fill after a read miss that already loaded the
/// whole structure.
pub(crate) fn backfill_whole(ctx: &SyncContext, key: &MappedKey, value: CacheValue) {
  let ctx_owned = ctx.clone();
  let key = key.clone();
  ctx.tasks.spawn(async move {
    let ctx = ctx_owned;
    let result = async {
      if !ctx.cache_exists(&key.cache_key).await? {
        ctx
          .cache_atomic(restore_commands(&key.cache_key, value))
          .await?;
        tracing::debug!("Backfilled {}", key.cache_key);
      }
      Ok::<_, SyncError>(())
    }
    .await;
    if let Err(err) = result {
      ctx.failures.cache(&key.cache_key, err);
    }
  });
}

/// Fire-and-forget cache fill after a point read miss. A warm key gets the
/// `point` commands; a cold one is restored whole.
pub(crate) fn backfill_point(ctx: &SyncContext, key: &MappedKey, point: Vec<CacheCommand>) {
  let ctx_owned = ctx.clone();
  let key = key.clone();
  ctx.tasks.spawn(async move {
    let ctx = ctx_owned;
    let result = async {
      if ctx.cache_exists(&key.cache_key).await? {
        if !point.is_empty() {
          ctx.cache_atomic(point).await?;
        }
      } else {
        rehydrate(&ctx, &key).await?;
      }
      Ok::<_, SyncError>(())
    }
    .await;
    if let Err(err) = result {
      ctx.failures.cache(&key.cache_key, err);
    }
  });
}
