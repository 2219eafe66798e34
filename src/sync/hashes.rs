use std::collections::BTreeMap;

use super::populate;
use super::SyncContext;
use crate::cache::{CacheCommand, CacheReply, CacheValue};
use crate::db::{OnConflict, SqlValue};
use crate::error::{SyncError, SyncResult};
use crate::keys::{MappedKey, StructureKind};

/// HSET / HMSET / HGET / HMGET / HGETALL / HEXISTS / HDEL over hash keys
pub struct HashCommands<'a> {
  ctx: &'a SyncContext,
}

impl<'a> HashCommands<'a> {
  pub(crate) fn new(ctx: &'a SyncContext) -> Self {
    Self { ctx }
  }

  fn key(&self, logical: &str) -> SyncResult<MappedKey> {
    self.ctx.keys.parse_kind(logical, StructureKind::Hash)
  }

  /// Values held by `fields` before `then` runs, plus `then`'s reply
  async fn fields_then(
    &self,
    key: &MappedKey,
    fields: impl Iterator<Item = String>,
    then: CacheCommand,
  ) -> SyncResult<(Vec<Option<String>>, CacheReply)> {
    let mut cmds: Vec<CacheCommand> = fields
      .map(|field| CacheCommand::HGet {
        key: key.cache_key.clone(),
        field,
      })
      .collect();
    cmds.push(then);
    let mut replies = self.ctx.cache_atomic(cmds).await?;
    let last = replies.pop().unwrap_or(CacheReply::Nil);
    let before = replies
      .into_iter()
      .map(CacheReply::into_opt_string)
      .collect::<Result<Vec<_>, _>>()?;
    Ok((before, last))
  }

  /// Shared write path of HSET and HMSET; returns the number of new fields.
  async fn write(&self, cmd: &str, logical: &str, pairs: &[(String, String)]) -> SyncResult<i64> {
    let key = self.key(logical)?;
    if pairs.is_empty() {
      return Err(SyncError::wrong_arity(cmd));
    }
    let (before, reply) = self
      .fields_then(
        &key,
        pairs.iter().map(|(f, _)| f.clone()),
        CacheCommand::HSet {
          key: key.cache_key.clone(),
          pairs: pairs.to_vec(),
        },
      )
      .await?;
    let added = reply.into_integer()?;

    let mut fresh: Vec<String> = Vec::new();
    let mut restore: Vec<(String, String)> = Vec::new();
    for ((field, _), prev) in pairs.iter().zip(before) {
      if fresh.contains(field) || restore.iter().any(|(f, _)| f == field) {
        continue;
      }
      match prev {
        Some(prev) => restore.push((field.clone(), prev)),
        None => fresh.push(field.clone()),
      }
    }
    let mut undo = Vec::new();
    if !fresh.is_empty() {
      undo.push(CacheCommand::HDel {
        key: key.cache_key.clone(),
        fields: fresh,
      });
    }
    if !restore.is_empty() {
      undo.push(CacheCommand::HSet {
        key: key.cache_key.clone(),
        pairs: restore,
      });
    }

    // Last write per field wins inside one multi-row upsert.
    let mut latest: BTreeMap<&str, &str> = BTreeMap::new();
    for (field, value) in pairs {
      latest.insert(field, value);
    }
    let rows = latest
      .into_iter()
      .map(|(f, v)| vec![SqlValue::from(f), SqlValue::from(v)])
      .collect();
    let table = key.table.clone();
    self.ctx.mirror(key, undo, move |sql| {
      Ok(vec![sql.build_upsert(
        &table,
        StructureKind::Hash,
        rows,
        OnConflict::Replace,
      )?])
    });
    Ok(added)
  }

  pub async fn hset(&self, logical: &str, field: &str, value: &str) -> SyncResult<i64> {
    self
      .write("hset", logical, &[(field.to_string(), value.to_string())])
      .await
  }

  /// HSET with several field/value pairs; returns the number of new fields.
  pub async fn hset_fields(&self, logical: &str, pairs: &[(String, String)]) -> SyncResult<i64> {
    self.write("hset", logical, pairs).await
  }

  pub async fn hmset(&self, logical: &str, pairs: &[(String, String)]) -> SyncResult<()> {
    self.write("hmset", logical, pairs).await.map(|_| ())
  }

  async fn durable_fields(&self, key: &MappedKey, fields: &[String]) -> BTreeMap<String, String> {
    let params: Vec<SqlValue> = fields.iter().map(|f| SqlValue::from(f.as_str())).collect();
    let rows = self
      .ctx
      .read(key, |sql| {
        let filter = sql.build_in("field", 1, params.len());
        sql.build_select(&key.table, &["field", "value"], Some(&filter), params)
      })
      .await;
    rows
      .iter()
      .filter_map(|r| Some((r.text(0)?, r.text(1)?)))
      .collect()
  }

  fn backfill_fields(&self, key: &MappedKey, found: &BTreeMap<String, String>) {
    populate::backfill_point(
      self.ctx,
      key,
      vec![CacheCommand::HSet {
        key: key.cache_key.clone(),
        pairs: found.iter().map(|(f, v)| (f.clone(), v.clone())).collect(),
      }],
    );
  }

  pub async fn hget(&self, logical: &str, field: &str) -> SyncResult<Option<String>> {
    let key = self.key(logical)?;
    let cached = self
      .ctx
      .cache(CacheCommand::HGet {
        key: key.cache_key.clone(),
        field: field.to_string(),
      })
      .await?
      .into_opt_string()?;
    if cached.is_some() {
      return Ok(cached);
    }
    let found = self.durable_fields(&key, &[field.to_string()]).await;
    let value = found.get(field).cloned();
    if value.is_some() {
      self.backfill_fields(&key, &found);
    }
    Ok(value)
  }

  /// Cached values with the gaps filled from the durable mirror
  pub async fn hmget(&self, logical: &str, fields: &[String]) -> SyncResult<Vec<Option<String>>> {
    let key = self.key(logical)?;
    if fields.is_empty() {
      return Err(SyncError::wrong_arity("hmget"));
    }
    let mut values = self
      .ctx
      .cache(CacheCommand::HMGet {
        key: key.cache_key.clone(),
        fields: fields.to_vec(),
      })
      .await?
      .into_opt_strings()?;
    let missing: Vec<String> = fields
      .iter()
      .zip(&values)
      .filter(|(_, v)| v.is_none())
      .map(|(f, _)| f.clone())
      .collect();
    if missing.is_empty() {
      return Ok(values);
    }

    let found = self.durable_fields(&key, &missing).await;
    if found.is_empty() {
      return Ok(values);
    }
    for (field, slot) in fields.iter().zip(values.iter_mut()) {
      if slot.is_none() {
        *slot = found.get(field).cloned();
      }
    }
    self.backfill_fields(&key, &found);
    Ok(values)
  }

  pub async fn hgetall(&self, logical: &str) -> SyncResult<BTreeMap<String, String>> {
    let key = self.key(logical)?;
    let cached = self
      .ctx
      .cache(CacheCommand::HGetAll {
        key: key.cache_key.clone(),
      })
      .await?
      .into_map()?;
    if !cached.is_empty() {
      return Ok(cached);
    }
    match populate::load(self.ctx, &key).await {
      Some(CacheValue::Hash(fields)) => {
        populate::backfill_whole(self.ctx, &key, CacheValue::Hash(fields.clone()));
        Ok(fields)
      }
      _ => Ok(BTreeMap::new()),
    }
  }

  pub async fn hexists(&self, logical: &str, field: &str) -> SyncResult<i64> {
    Ok(self.hget(logical, field).await?.map_or(0, |_| 1))
  }

  pub async fn hdel(&self, logical: &str, fields: &[String]) -> SyncResult<i64> {
    let key = self.key(logical)?;
    if fields.is_empty() {
      return Err(SyncError::wrong_arity("hdel"));
    }
    let (before, reply) = self
      .fields_then(
        &key,
        fields.iter().cloned(),
        CacheCommand::HDel {
          key: key.cache_key.clone(),
          fields: fields.to_vec(),
        },
      )
      .await?;
    let removed = reply.into_integer()?;

    let mut restore: Vec<(String, String)> = Vec::new();
    for (field, prev) in fields.iter().zip(before) {
      if let Some(prev) = prev {
        if !restore.iter().any(|(f, _)| f == field) {
          restore.push((field.clone(), prev));
        }
      }
    }
    let undo = if restore.is_empty() {
      Vec::new()
    } else {
      vec![CacheCommand::HSet {
        key: key.cache_key.clone(),
        pairs: restore,
      }]
    };
    let values: Vec<SqlValue> = fields.iter().map(|f| SqlValue::from(f.as_str())).collect();
    let table = key.table.clone();
    self.ctx.mirror_removal(key, undo, move |sql| {
      Ok(vec![sql.build_delete_in(&table, "field", values)?])
    });
    Ok(removed)
  }
}
