use std::collections::BTreeMap;

use super::ordered;
use super::populate;
use super::SyncContext;
use crate::cache::{format_score, CacheCommand, CacheReply, CacheValue, ScoreRange};
use crate::db::{OnConflict, SqlValue};
use crate::error::{SyncError, SyncResult};
use crate::keys::{MappedKey, StructureKind};

/// ZADD / ZINCRBY / ZSCORE / ZRANK / ZRANGEBYSCORE over sorted-set keys
pub struct SortedSetCommands<'a> {
  ctx: &'a SyncContext,
}

impl<'a> SortedSetCommands<'a> {
  pub(crate) fn new(ctx: &'a SyncContext) -> Self {
    Self { ctx }
  }

  fn key(&self, logical: &str) -> SyncResult<MappedKey> {
    self.ctx.keys.parse_kind(logical, StructureKind::SortedSet)
  }

  pub async fn zadd(&self, logical: &str, members: &[(f64, String)]) -> SyncResult<i64> {
    let key = self.key(logical)?;
    if members.is_empty() {
      return Err(SyncError::wrong_arity("zadd"));
    }
    if members.iter().any(|(score, _)| !score.is_finite()) {
      return Err(SyncError::validation("value is not a valid float"));
    }

    let mut cmds: Vec<CacheCommand> = members
      .iter()
      .map(|(_, m)| CacheCommand::ZScore {
        key: key.cache_key.clone(),
        member: m.clone(),
      })
      .collect();
    cmds.push(CacheCommand::ZAdd {
      key: key.cache_key.clone(),
      members: members.to_vec(),
      nx: false,
    });
    let mut replies = self.ctx.cache_atomic(cmds).await?;
    let added = replies
      .pop()
      .map(CacheReply::into_integer)
      .transpose()?
      .unwrap_or_default();
    let previous = replies
      .into_iter()
      .map(|r| {
        r.into_opt_string()
          .map(|s| s.and_then(|s| s.parse::<f64>().ok()))
      })
      .collect::<Result<Vec<_>, _>>()?;

    // First capture per member wins; a repeated member saw the same state.
    let mut fresh = Vec::new();
    let mut restore = Vec::new();
    for ((_, member), prev) in members.iter().zip(previous) {
      if fresh.contains(member) || restore.iter().any(|(_, m)| m == member) {
        continue;
      }
      match prev {
        Some(score) => restore.push((score, member.clone())),
        None => fresh.push(member.clone()),
      }
    }
    let mut undo = Vec::new();
    if !fresh.is_empty() {
      undo.push(CacheCommand::ZRem {
        key: key.cache_key.clone(),
        members: fresh,
      });
    }
    if !restore.is_empty() {
      undo.push(CacheCommand::ZAdd {
        key: key.cache_key.clone(),
        members: restore,
        nx: false,
      });
    }

    // Later scores for a repeated member win, as in the cache.
    let mut latest: BTreeMap<&str, f64> = BTreeMap::new();
    for (score, member) in members {
      latest.insert(member, *score);
    }
    let rows = latest
      .into_iter()
      .map(|(m, score)| vec![SqlValue::Real(score), SqlValue::from(m)])
      .collect();
    let table = key.table.clone();
    self.ctx.mirror(key, undo, move |sql| {
      Ok(vec![sql.build_upsert(
        &table,
        StructureKind::SortedSet,
        rows,
        OnConflict::Replace,
      )?])
    });
    Ok(added)
  }

  /// Restores a cold key, seeds a missing member from its durable score,
  /// increments, and adds the delta to the durable score.
  pub async fn zincrby(&self, logical: &str, delta: f64, member: &str) -> SyncResult<String> {
    let key = self.key(logical)?;
    if !delta.is_finite() {
      return Err(SyncError::validation("value is not a valid float"));
    }
    populate::rehydrate(self.ctx, &key).await?;
    let seed = self.durable_score(&key, member).await.unwrap_or(0.0);
    let replies = self
      .ctx
      .cache_atomic(vec![
        CacheCommand::ZAdd {
          key: key.cache_key.clone(),
          members: vec![(seed, member.to_string())],
          nx: true,
        },
        CacheCommand::ZIncrBy {
          key: key.cache_key.clone(),
          delta,
          member: member.to_string(),
        },
      ])
      .await?;
    let score = replies
      .into_iter()
      .nth(1)
      .map(|r| r.into_opt_string())
      .transpose()?
      .flatten()
      .unwrap_or_else(|| format_score(seed + delta));

    let undo = vec![CacheCommand::ZIncrBy {
      key: key.cache_key.clone(),
      delta: -delta,
      member: member.to_string(),
    }];
    let row = vec![SqlValue::Real(delta), SqlValue::from(member)];
    let table = key.table.clone();
    self.ctx.mirror(key, undo, move |sql| {
      Ok(vec![sql.build_upsert(
        &table,
        StructureKind::SortedSet,
        vec![row],
        OnConflict::Add,
      )?])
    });
    Ok(score)
  }

  async fn durable_score(&self, key: &MappedKey, member: &str) -> Option<f64> {
    let owned = member.to_string();
    let rows = self
      .ctx
      .read(key, |sql| {
        sql.build_select(
          &key.table,
          &["score"],
          Some(&format!("member = {}", sql.ph(1))),
          vec![SqlValue::Text(owned)],
        )
      })
      .await;
    rows.first().and_then(|r| r.float(0))
  }

  pub async fn zscore(&self, logical: &str, member: &str) -> SyncResult<Option<String>> {
    let key = self.key(logical)?;
    let cached = self
      .ctx
      .cache(CacheCommand::ZScore {
        key: key.cache_key.clone(),
        member: member.to_string(),
      })
      .await?
      .into_opt_string()?;
    if cached.is_some() {
      return Ok(cached);
    }
    let Some(score) = self.durable_score(&key, member).await else {
      return Ok(None);
    };
    populate::backfill_point(
      self.ctx,
      &key,
      vec![CacheCommand::ZAdd {
        key: key.cache_key.clone(),
        members: vec![(score, member.to_string())],
        nx: true,
      }],
    );
    Ok(Some(format_score(score)))
  }

  pub async fn zrank(&self, logical: &str, member: &str) -> SyncResult<Option<i64>> {
    let key = self.key(logical)?;
    let cached = self
      .ctx
      .cache(CacheCommand::ZRank {
        key: key.cache_key.clone(),
        member: member.to_string(),
      })
      .await?
      .into_opt_integer()?;
    if cached.is_some() {
      return Ok(cached);
    }
    let rank = ordered::durable_rank(self.ctx, &key, member).await;
    if rank.is_some() {
      // A rank depends on every member, so only a whole restore is useful.
      populate::backfill_point(self.ctx, &key, Vec::new());
    }
    Ok(rank)
  }

  /// ZRANK answered by the durable mirror only
  pub async fn durable_rank(&self, logical: &str, member: &str) -> SyncResult<Option<i64>> {
    let key = self.key(logical)?;
    Ok(ordered::durable_rank(self.ctx, &key, member).await)
  }

  pub async fn zrangebyscore(&self, logical: &str, range: ScoreRange) -> SyncResult<Vec<String>> {
    self.range(logical, range, false).await
  }

  pub async fn zrevrangebyscore(&self, logical: &str, range: ScoreRange) -> SyncResult<Vec<String>> {
    self.range(logical, range, true).await
  }

  async fn range(&self, logical: &str, range: ScoreRange, rev: bool) -> SyncResult<Vec<String>> {
    let key = self.key(logical)?;
    let cached = self
      .ctx
      .cache(CacheCommand::ZRangeByScore {
        key: key.cache_key.clone(),
        range: range.clone(),
        rev,
      })
      .await?
      .into_strings()?;
    // An empty answer from a live key is authoritative.
    if !cached.is_empty() || self.ctx.cache_exists(&key.cache_key).await? {
      return Ok(cached);
    }
    match populate::load(self.ctx, &key).await {
      Some(CacheValue::SortedSet(members)) => {
        let out = CacheValue::range_by_score(&members, &range, rev);
        populate::backfill_whole(self.ctx, &key, CacheValue::SortedSet(members));
        Ok(out)
      }
      _ => Ok(Vec::new()),
    }
  }
}
