use super::ordered;
use super::populate;
use super::SyncContext;
use crate::cache::{CacheCommand, CacheValue};
use crate::db::{OnConflict, SqlValue};
use crate::error::{CacheError, SyncError, SyncResult};
use crate::keys::{MappedKey, StructureKind};

/// LPUSH / LINDEX / LSET / RPOP over list keys
pub struct ListCommands<'a> {
  ctx: &'a SyncContext,
}

impl<'a> ListCommands<'a> {
  pub(crate) fn new(ctx: &'a SyncContext) -> Self {
    Self { ctx }
  }

  fn key(&self, logical: &str) -> SyncResult<MappedKey> {
    self.ctx.keys.parse_kind(logical, StructureKind::List)
  }

  pub async fn lpush(&self, logical: &str, values: &[String]) -> SyncResult<i64> {
    let key = self.key(logical)?;
    if values.is_empty() {
      return Err(SyncError::wrong_arity("lpush"));
    }
    // Taken before the cache write so sequences follow call order.
    let sequences = self.ctx.clock.push_sequences(values.len());
    let len = self
      .ctx
      .cache(CacheCommand::LPush {
        key: key.cache_key.clone(),
        values: values.to_vec(),
      })
      .await?
      .into_integer()?;

    let undo = values
      .iter()
      .map(|v| CacheCommand::LRem {
        key: key.cache_key.clone(),
        count: 1,
        value: v.clone(),
      })
      .collect();
    let rows: Vec<Vec<SqlValue>> = sequences
      .into_iter()
      .zip(values.iter())
      .map(|(seq, v)| vec![SqlValue::Real(seq), SqlValue::from(v.as_str())])
      .collect();
    let table = key.table.clone();
    self.ctx.mirror(key, undo, move |sql| {
      Ok(vec![sql.build_upsert(
        &table,
        StructureKind::List,
        rows,
        OnConflict::Replace,
      )?])
    });
    Ok(len)
  }

  /// Falls back to the durable mirror on a cache miss and then reconciles the
  /// cached list with it.
  pub async fn lindex(&self, logical: &str, index: i64) -> SyncResult<Option<String>> {
    let key = self.key(logical)?;
    let cached = self
      .ctx
      .cache(CacheCommand::LIndex {
        key: key.cache_key.clone(),
        index,
      })
      .await?
      .into_opt_string()?;
    if cached.is_some() {
      return Ok(cached);
    }

    let found = ordered::durable_index(self.ctx, &key, index).await;
    if found.is_some() {
      tracing::debug!("Durable index hit for {}[{}]", key.cache_key, index);
      self.spawn_reconcile(key);
    }
    Ok(found)
  }

  /// LINDEX answered by the durable mirror only
  pub async fn durable_index(&self, logical: &str, index: i64) -> SyncResult<Option<String>> {
    let key = self.key(logical)?;
    Ok(ordered::durable_index(self.ctx, &key, index).await)
  }

  pub async fn lset(&self, logical: &str, index: i64, value: &str) -> SyncResult<()> {
    let key = self.key(logical)?;
    let previous = match self.cache_lset(&key, index, value).await {
      Ok(previous) => previous,
      Err(SyncError::Cache(CacheError::Command(_))) => {
        // Cold or shorter cache: the durable mirror decides.
        let rows = match populate::load(self.ctx, &key).await {
          Some(CacheValue::List(rows)) => rows,
          _ => return Err(SyncError::IndexNotFound),
        };
        if ordered::durable_index(self.ctx, &key, index).await.is_none() {
          return Err(SyncError::IndexNotFound);
        }
        ordered::reconcile_list(self.ctx, &key, rows.into_iter().collect()).await?;
        match self.cache_lset(&key, index, value).await {
          Ok(previous) => previous,
          Err(SyncError::Cache(CacheError::Command(_))) => return Err(SyncError::IndexNotFound),
          Err(e) => return Err(e),
        }
      }
      Err(e) => return Err(e),
    };

    let undo = previous
      .map(|previous| {
        vec![CacheCommand::LSet {
          key: key.cache_key.clone(),
          index,
          value: previous,
        }]
      })
      .unwrap_or_default();
    let table = key.table.clone();
    let value = value.to_string();
    self.ctx.mirror(key, undo, move |sql| {
      Ok(vec![ordered::set_at_index(sql, &table, index, value)?])
    });
    Ok(())
  }

  /// `LINDEX` + `LSET` in one block; yields the replaced value.
  async fn cache_lset(&self, key: &MappedKey, index: i64, value: &str) -> SyncResult<Option<String>> {
    let replies = self
      .ctx
      .cache_atomic(vec![
        CacheCommand::LIndex {
          key: key.cache_key.clone(),
          index,
        },
        CacheCommand::LSet {
          key: key.cache_key.clone(),
          index,
          value: value.to_string(),
        },
      ])
      .await?;
    Ok(
      replies
        .into_iter()
        .next()
        .map(|r| r.into_opt_string())
        .transpose()?
        .flatten(),
    )
  }

  /// Pops the tail. A cold list is restored from the durable mirror first.
  pub async fn rpop(&self, logical: &str) -> SyncResult<Option<String>> {
    let key = self.key(logical)?;
    let mut popped = self.cache_rpop(&key).await?;
    if popped.is_none() && populate::rehydrate(self.ctx, &key).await? {
      popped = self.cache_rpop(&key).await?;
    }
    let Some(value) = popped else {
      return Ok(None);
    };

    let undo = vec![CacheCommand::RPush {
      key: key.cache_key.clone(),
      values: vec![value.clone()],
    }];
    let table = key.table.clone();
    self
      .ctx
      .mirror_removal(key, undo, move |sql| Ok(vec![ordered::pop_tail(sql, &table)?]));
    Ok(Some(value))
  }

  async fn cache_rpop(&self, key: &MappedKey) -> SyncResult<Option<String>> {
    Ok(
      self
        .ctx
        .cache(CacheCommand::RPop {
          key: key.cache_key.clone(),
        })
        .await?
        .into_opt_string()?,
    )
  }

  fn spawn_reconcile(&self, key: MappedKey) {
    let ctx = self.ctx.clone();
    self.ctx.tasks.spawn(async move {
      let rows = match populate::load(&ctx, &key).await {
        Some(CacheValue::List(rows)) => rows,
        _ => return,
      };
      if let Err(err) = ordered::reconcile_list(&ctx, &key, rows.into_iter().collect()).await {
        ctx.failures.cache(&key.cache_key, err);
      }
    });
  }
}
