use super::populate;
use super::SyncContext;
use crate::cache::{CacheCommand, CacheValue};
use crate::db::{OnConflict, SqlValue};
use crate::error::SyncResult;
use crate::keys::StructureKind;

/// SET / GET / INCR over `str:<bucket>:<id>` keys
pub struct StringCommands<'a> {
  ctx: &'a SyncContext,
}

impl<'a> StringCommands<'a> {
  pub(crate) fn new(ctx: &'a SyncContext) -> Self {
    Self { ctx }
  }

  pub async fn set(&self, bucket: &str, id: &str, value: &str) -> SyncResult<()> {
    let key = self.ctx.keys.string_key(bucket, id)?;
    let replies = self
      .ctx
      .cache_atomic(vec![
        CacheCommand::Get {
          key: key.cache_key.clone(),
        },
        CacheCommand::Set {
          key: key.cache_key.clone(),
          value: value.to_string(),
          nx: false,
        },
      ])
      .await?;
    let previous = replies
      .into_iter()
      .next()
      .map(|r| r.into_opt_string())
      .transpose()?
      .flatten();

    let undo = vec![match previous {
      Some(previous) => CacheCommand::Set {
        key: key.cache_key.clone(),
        value: previous,
        nx: false,
      },
      None => CacheCommand::Del {
        keys: vec![key.cache_key.clone()],
      },
    }];
    let row = vec![SqlValue::from(id), SqlValue::from(value)];
    let table = key.table.clone();
    self.ctx.mirror(key, undo, move |sql| {
      Ok(vec![sql.build_upsert(
        &table,
        StructureKind::String,
        vec![row],
        OnConflict::Replace,
      )?])
    });
    Ok(())
  }

  pub async fn get(&self, bucket: &str, id: &str) -> SyncResult<Option<String>> {
    let key = self.ctx.keys.string_key(bucket, id)?;
    let cached = self
      .ctx
      .cache(CacheCommand::Get {
        key: key.cache_key.clone(),
      })
      .await?
      .into_opt_string()?;
    if cached.is_some() {
      return Ok(cached);
    }

    match populate::load(self.ctx, &key).await {
      Some(CacheValue::String(value)) => {
        tracing::debug!("Read-through hit for {}", key.cache_key);
        populate::backfill_whole(self.ctx, &key, CacheValue::String(value.clone()));
        Ok(Some(value))
      }
      _ => Ok(None),
    }
  }

  /// Seeds a cold cache value from the durable row before incrementing.
  pub async fn incr(&self, bucket: &str, id: &str) -> SyncResult<i64> {
    let key = self.ctx.keys.string_key(bucket, id)?;
    let seed = match populate::load(self.ctx, &key).await {
      Some(CacheValue::String(value)) => value,
      _ => "0".to_string(),
    };
    let replies = self
      .ctx
      .cache_atomic(vec![
        CacheCommand::Set {
          key: key.cache_key.clone(),
          value: seed,
          nx: true,
        },
        CacheCommand::Incr {
          key: key.cache_key.clone(),
        },
      ])
      .await?;
    let value = replies
      .into_iter()
      .nth(1)
      .map(|r| r.into_integer())
      .transpose()?
      .unwrap_or_default();

    let undo = vec![CacheCommand::Decr {
      key: key.cache_key.clone(),
    }];
    let row = vec![SqlValue::from(id), SqlValue::Text(value.to_string())];
    let table = key.table.clone();
    self.ctx.mirror(key, undo, move |sql| {
      Ok(vec![sql.build_upsert(
        &table,
        StructureKind::String,
        vec![row],
        OnConflict::Replace,
      )?])
    });
    Ok(value)
  }
}
