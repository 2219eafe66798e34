use std::collections::BTreeSet;

use super::populate;
use super::SyncContext;
use crate::cache::{CacheCommand, CacheReply, CacheValue};
use crate::db::{OnConflict, SqlValue};
use crate::error::{SyncError, SyncResult};
use crate::keys::{MappedKey, StructureKind};

/// SADD / SREM / SMEMBERS / SISMEMBER / SCARD over set keys
pub struct SetCommands<'a> {
  ctx: &'a SyncContext,
}

impl<'a> SetCommands<'a> {
  pub(crate) fn new(ctx: &'a SyncContext) -> Self {
    Self { ctx }
  }

  fn key(&self, logical: &str) -> SyncResult<MappedKey> {
    self.ctx.keys.parse_kind(logical, StructureKind::Set)
  }

  /// Membership of each member before `then` runs, in one atomic block
  async fn membership_then(
    &self,
    key: &MappedKey,
    members: &[String],
    then: CacheCommand,
  ) -> SyncResult<(Vec<bool>, i64)> {
    let mut cmds: Vec<CacheCommand> = members
      .iter()
      .map(|m| CacheCommand::SIsMember {
        key: key.cache_key.clone(),
        member: m.clone(),
      })
      .collect();
    cmds.push(then);
    let mut replies = self.ctx.cache_atomic(cmds).await?;
    let count = replies
      .pop()
      .map(CacheReply::into_integer)
      .transpose()?
      .unwrap_or_default();
    let before = replies
      .into_iter()
      .map(|r| r.into_integer().map(|n| n > 0))
      .collect::<Result<Vec<_>, _>>()?;
    Ok((before, count))
  }

  pub async fn sadd(&self, logical: &str, members: &[String]) -> SyncResult<i64> {
    let key = self.key(logical)?;
    if members.is_empty() {
      return Err(SyncError::wrong_arity("sadd"));
    }
    let (before, added) = self
      .membership_then(
        &key,
        members,
        CacheCommand::SAdd {
          key: key.cache_key.clone(),
          members: members.to_vec(),
        },
      )
      .await?;

    let fresh: Vec<String> = members
      .iter()
      .zip(before)
      .filter(|(_, was_member)| !was_member)
      .map(|(m, _)| m.clone())
      .collect();
    let undo = if fresh.is_empty() {
      Vec::new()
    } else {
      vec![CacheCommand::SRem {
        key: key.cache_key.clone(),
        members: fresh,
      }]
    };
    // One row per distinct member; an upsert may not touch a row twice.
    let distinct: BTreeSet<&str> = members.iter().map(String::as_str).collect();
    let rows = distinct
      .into_iter()
      .map(|m| vec![SqlValue::from(m)])
      .collect();
    let table = key.table.clone();
    self.ctx.mirror(key, undo, move |sql| {
      Ok(vec![sql.build_upsert(
        &table,
        StructureKind::Set,
        rows,
        OnConflict::Replace,
      )?])
    });
    Ok(added)
  }

  pub async fn srem(&self, logical: &str, members: &[String]) -> SyncResult<i64> {
    let key = self.key(logical)?;
    if members.is_empty() {
      return Err(SyncError::wrong_arity("srem"));
    }
    let (before, removed) = self
      .membership_then(
        &key,
        members,
        CacheCommand::SRem {
          key: key.cache_key.clone(),
          members: members.to_vec(),
        },
      )
      .await?;

    let gone: Vec<String> = members
      .iter()
      .zip(before)
      .filter(|(_, was_member)| *was_member)
      .map(|(m, _)| m.clone())
      .collect();
    let undo = if gone.is_empty() {
      Vec::new()
    } else {
      vec![CacheCommand::SAdd {
        key: key.cache_key.clone(),
        members: gone,
      }]
    };
    let values: Vec<SqlValue> = members.iter().map(|m| SqlValue::from(m.as_str())).collect();
    let table = key.table.clone();
    self.ctx.mirror_removal(key, undo, move |sql| {
      Ok(vec![sql.build_delete_in(&table, "member", values)?])
    });
    Ok(removed)
  }

  pub async fn smembers(&self, logical: &str) -> SyncResult<Vec<String>> {
    let key = self.key(logical)?;
    let cached = self
      .ctx
      .cache(CacheCommand::SMembers {
        key: key.cache_key.clone(),
      })
      .await?
      .into_strings()?;
    if !cached.is_empty() {
      return Ok(cached);
    }
    match populate::load(self.ctx, &key).await {
      Some(CacheValue::Set(members)) => {
        let out = members.iter().cloned().collect();
        populate::backfill_whole(self.ctx, &key, CacheValue::Set(members));
        Ok(out)
      }
      _ => Ok(Vec::new()),
    }
  }

  pub async fn sismember(&self, logical: &str, member: &str) -> SyncResult<i64> {
    let key = self.key(logical)?;
    let cached = self
      .ctx
      .cache(CacheCommand::SIsMember {
        key: key.cache_key.clone(),
        member: member.to_string(),
      })
      .await?
      .into_integer()?;
    if cached > 0 {
      return Ok(1);
    }
    let owned = member.to_string();
    let rows = self
      .ctx
      .read(&key, |sql| {
        sql.build_select(
          &key.table,
          &["member"],
          Some(&format!("member = {}", sql.ph(1))),
          vec![SqlValue::Text(owned)],
        )
      })
      .await;
    if rows.is_empty() {
      return Ok(0);
    }
    populate::backfill_point(
      self.ctx,
      &key,
      vec![CacheCommand::SAdd {
        key: key.cache_key.clone(),
        members: vec![member.to_string()],
      }],
    );
    Ok(1)
  }

  pub async fn scard(&self, logical: &str) -> SyncResult<i64> {
    let key = self.key(logical)?;
    let cached = self
      .ctx
      .cache(CacheCommand::SCard {
        key: key.cache_key.clone(),
      })
      .await?
      .into_integer()?;
    if cached > 0 {
      return Ok(cached);
    }
    match populate::load(self.ctx, &key).await {
      Some(CacheValue::Set(members)) => {
        let count = members.len() as i64;
        populate::backfill_whole(self.ctx, &key, CacheValue::Set(members));
        Ok(count)
      }
      _ => Ok(0),
    }
  }
}
