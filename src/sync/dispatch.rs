//! Redis-style command lines routed onto the command families

use super::SyncEngine;
use crate::cache::{CacheReply, ScoreBound, ScoreRange};
use crate::error::{SyncError, SyncResult};

/// Execute one command. `cmd` is matched case-insensitively.
pub(crate) async fn execute(engine: &SyncEngine, cmd: &str, args: &[String]) -> SyncResult<CacheReply> {
  match cmd.to_uppercase().as_str() {
    "PING" => Ok(CacheReply::Status("PONG".to_string())),
    "SET" => cmd_set(engine, args).await,
    "GET" => cmd_get(engine, args).await,
    "INCR" => cmd_incr(engine, args).await,
    "LPUSH" => cmd_lpush(engine, args).await,
    "LINDEX" => cmd_lindex(engine, args).await,
    "LSET" => cmd_lset(engine, args).await,
    "RPOP" => cmd_rpop(engine, args).await,
    "SADD" => cmd_sadd(engine, args).await,
    "SREM" => cmd_srem(engine, args).await,
    "SMEMBERS" => cmd_smembers(engine, args).await,
    "SISMEMBER" => cmd_sismember(engine, args).await,
    "SCARD" => cmd_scard(engine, args).await,
    "ZADD" => cmd_zadd(engine, args).await,
    "ZINCRBY" => cmd_zincrby(engine, args).await,
    "ZSCORE" => cmd_zscore(engine, args).await,
    "ZRANK" => cmd_zrank(engine, args).await,
    "ZRANGEBYSCORE" => cmd_zrange(engine, args, false).await,
    "ZREVRANGEBYSCORE" => cmd_zrange(engine, args, true).await,
    "HSET" => cmd_hset(engine, args).await,
    "HMSET" => cmd_hmset(engine, args).await,
    "HGET" => cmd_hget(engine, args).await,
    "HMGET" => cmd_hmget(engine, args).await,
    "HGETALL" => cmd_hgetall(engine, args).await,
    "HEXISTS" => cmd_hexists(engine, args).await,
    "HDEL" => cmd_hdel(engine, args).await,
    "DEL" => cmd_del(engine, args).await,
    "EXISTS" => cmd_exists(engine, args).await,
    "RENAME" => cmd_rename(engine, args).await,
    "EXPIRE" => cmd_expire(engine, args).await,
    _ => Err(SyncError::validation(format!("unknown command '{}'", cmd))),
  }
}

fn arity(cmd: &str, args: &[String], exact: usize) -> SyncResult<()> {
  if args.len() != exact {
    return Err(SyncError::wrong_arity(cmd));
  }
  Ok(())
}

fn at_least(cmd: &str, args: &[String], min: usize) -> SyncResult<()> {
  if args.len() < min {
    return Err(SyncError::wrong_arity(cmd));
  }
  Ok(())
}

fn parse_int(s: &str) -> SyncResult<i64> {
  s.parse::<i64>()
    .map_err(|_| SyncError::validation("value is not an integer or out of range"))
}

fn parse_float(s: &str) -> SyncResult<f64> {
  s.parse::<f64>()
    .ok()
    .filter(|f| f.is_finite())
    .ok_or_else(|| SyncError::validation("value is not a valid float"))
}

fn parse_bound(s: &str) -> SyncResult<ScoreBound> {
  ScoreBound::parse(s).ok_or_else(|| SyncError::validation("min or max is not a float"))
}

/// `field value [field value ...]`
fn pairs(cmd: &str, args: &[String]) -> SyncResult<Vec<(String, String)>> {
  if args.is_empty() || args.len() % 2 != 0 {
    return Err(SyncError::wrong_arity(cmd));
  }
  Ok(
    args
      .chunks_exact(2)
      .map(|p| (p[0].clone(), p[1].clone()))
      .collect(),
  )
}

async fn cmd_set(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("set", args, 3)?;
  engine.strings().set(&args[0], &args[1], &args[2]).await?;
  Ok(CacheReply::ok())
}

async fn cmd_get(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("get", args, 2)?;
  let value = engine.strings().get(&args[0], &args[1]).await?;
  Ok(CacheReply::opt_bulk(value))
}

async fn cmd_incr(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("incr", args, 2)?;
  Ok(CacheReply::Integer(engine.strings().incr(&args[0], &args[1]).await?))
}

async fn cmd_lpush(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  at_least("lpush", args, 2)?;
  Ok(CacheReply::Integer(engine.lists().lpush(&args[0], &args[1..]).await?))
}

async fn cmd_lindex(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("lindex", args, 2)?;
  let index = parse_int(&args[1])?;
  Ok(CacheReply::opt_bulk(engine.lists().lindex(&args[0], index).await?))
}

async fn cmd_lset(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("lset", args, 3)?;
  let index = parse_int(&args[1])?;
  engine.lists().lset(&args[0], index, &args[2]).await?;
  Ok(CacheReply::ok())
}

async fn cmd_rpop(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("rpop", args, 1)?;
  Ok(CacheReply::opt_bulk(engine.lists().rpop(&args[0]).await?))
}

async fn cmd_sadd(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  at_least("sadd", args, 2)?;
  Ok(CacheReply::Integer(engine.sets().sadd(&args[0], &args[1..]).await?))
}

async fn cmd_srem(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  at_least("srem", args, 2)?;
  Ok(CacheReply::Integer(engine.sets().srem(&args[0], &args[1..]).await?))
}

async fn cmd_smembers(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("smembers", args, 1)?;
  Ok(CacheReply::strings(engine.sets().smembers(&args[0]).await?))
}

async fn cmd_sismember(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("sismember", args, 2)?;
  Ok(CacheReply::Integer(
    engine.sets().sismember(&args[0], &args[1]).await?,
  ))
}

async fn cmd_scard(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("scard", args, 1)?;
  Ok(CacheReply::Integer(engine.sets().scard(&args[0]).await?))
}

async fn cmd_zadd(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  if args.len() < 3 || (args.len() - 1) % 2 != 0 {
    return Err(SyncError::wrong_arity("zadd"));
  }
  let members = args[1..]
    .chunks_exact(2)
    .map(|p| Ok((parse_float(&p[0])?, p[1].clone())))
    .collect::<SyncResult<Vec<_>>>()?;
  Ok(CacheReply::Integer(
    engine.sorted_sets().zadd(&args[0], &members).await?,
  ))
}

async fn cmd_zincrby(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("zincrby", args, 3)?;
  let delta = parse_float(&args[1])?;
  let score = engine.sorted_sets().zincrby(&args[0], delta, &args[2]).await?;
  Ok(CacheReply::Bulk(score))
}

async fn cmd_zscore(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("zscore", args, 2)?;
  Ok(CacheReply::opt_bulk(
    engine.sorted_sets().zscore(&args[0], &args[1]).await?,
  ))
}

async fn cmd_zrank(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("zrank", args, 2)?;
  let rank = engine.sorted_sets().zrank(&args[0], &args[1]).await?;
  Ok(rank.map(CacheReply::Integer).unwrap_or(CacheReply::Nil))
}

/// `key min max [WITHSCORES] [LIMIT offset count]`; the reverse form takes
/// `max min`.
fn parse_range(args: &[String], rev: bool) -> SyncResult<ScoreRange> {
  let (lo, hi) = if rev { (&args[2], &args[1]) } else { (&args[1], &args[2]) };
  let mut range = ScoreRange::new(parse_bound(lo)?, parse_bound(hi)?);
  let mut i = 3;
  while i < args.len() {
    match args[i].to_uppercase().as_str() {
      "WITHSCORES" => {
        range = range.with_scores();
        i += 1;
      }
      "LIMIT" => {
        if i + 2 >= args.len() {
          return Err(SyncError::validation("syntax error"));
        }
        let offset = parse_int(&args[i + 1])?;
        let count = parse_int(&args[i + 2])?;
        if offset < 0 {
          // Redis answers a negative offset with an empty range.
          range = range.limit(0, 0);
        } else {
          range = range.limit(offset as usize, count);
        }
        i += 3;
      }
      _ => return Err(SyncError::validation("syntax error")),
    }
  }
  Ok(range)
}

async fn cmd_zrange(engine: &SyncEngine, args: &[String], rev: bool) -> SyncResult<CacheReply> {
  let name = if rev { "zrevrangebyscore" } else { "zrangebyscore" };
  at_least(name, args, 3)?;
  let range = parse_range(args, rev)?;
  let zsets = engine.sorted_sets();
  let items = if rev {
    zsets.zrevrangebyscore(&args[0], range).await?
  } else {
    zsets.zrangebyscore(&args[0], range).await?
  };
  Ok(CacheReply::strings(items))
}

async fn cmd_hset(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  at_least("hset", args, 3)?;
  let fields = pairs("hset", &args[1..])?;
  let added = match fields.as_slice() {
    [(field, value)] => engine.hashes().hset(&args[0], field, value).await?,
    _ => engine.hashes().hset_fields(&args[0], &fields).await?,
  };
  Ok(CacheReply::Integer(added))
}

async fn cmd_hmset(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  at_least("hmset", args, 3)?;
  let fields = pairs("hmset", &args[1..])?;
  engine.hashes().hmset(&args[0], &fields).await?;
  Ok(CacheReply::ok())
}

async fn cmd_hget(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("hget", args, 2)?;
  Ok(CacheReply::opt_bulk(
    engine.hashes().hget(&args[0], &args[1]).await?,
  ))
}

async fn cmd_hmget(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  at_least("hmget", args, 2)?;
  let values = engine.hashes().hmget(&args[0], &args[1..]).await?;
  Ok(CacheReply::Array(
    values.into_iter().map(CacheReply::opt_bulk).collect(),
  ))
}

async fn cmd_hgetall(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("hgetall", args, 1)?;
  let map = engine.hashes().hgetall(&args[0]).await?;
  Ok(CacheReply::strings(map.into_iter().flat_map(|(f, v)| [f, v])))
}

async fn cmd_hexists(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("hexists", args, 2)?;
  Ok(CacheReply::Integer(
    engine.hashes().hexists(&args[0], &args[1]).await?,
  ))
}

async fn cmd_hdel(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  at_least("hdel", args, 2)?;
  Ok(CacheReply::Integer(engine.hashes().hdel(&args[0], &args[1..]).await?))
}

async fn cmd_del(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  at_least("del", args, 1)?;
  Ok(CacheReply::Integer(engine.keyspace().del(args).await?))
}

async fn cmd_exists(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("exists", args, 1)?;
  Ok(CacheReply::Integer(engine.keyspace().exists(&args[0]).await?))
}

async fn cmd_rename(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("rename", args, 2)?;
  engine.keyspace().rename(&args[0], &args[1]).await?;
  Ok(CacheReply::ok())
}

async fn cmd_expire(engine: &SyncEngine, args: &[String]) -> SyncResult<CacheReply> {
  arity("expire", args, 2)?;
  let seconds = parse_int(&args[1])?;
  if seconds < 0 {
    // A negative TTL expires the key immediately.
    return Ok(CacheReply::Integer(engine.keyspace().expire(&args[0], 0).await?));
  }
  Ok(CacheReply::Integer(
    engine.keyspace().expire(&args[0], seconds as u64).await?,
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn test_parse_range_options() {
    let range = parse_range(&args(&["zset:b", "-inf", "(5", "WITHSCORES", "LIMIT", "1", "2"]), false).unwrap();
    assert_eq!(range.min, ScoreBound::NegInfinity);
    assert_eq!(range.max, ScoreBound::Exclusive(5.0));
    assert!(range.with_scores);
    assert_eq!(range.limit, Some((1, 2)));
  }

  #[test]
  fn test_reverse_range_swaps_bounds() {
    let range = parse_range(&args(&["zset:b", "+inf", "10"]), true).unwrap();
    assert_eq!(range.min, ScoreBound::Inclusive(10.0));
    assert_eq!(range.max, ScoreBound::PosInfinity);
  }

  #[test]
  fn test_parse_range_rejects_garbage() {
    assert!(parse_range(&args(&["zset:b", "abc", "1"]), false).is_err());
    assert!(parse_range(&args(&["zset:b", "0", "1", "LIMIT", "0"]), false).is_err());
    assert!(parse_range(&args(&["zset:b", "0", "1", "BOGUS"]), false).is_err());
  }

  #[test]
  fn test_pairs_needs_even_arguments() {
    assert!(pairs("hset", &args(&["f1", "v1", "f2"])).is_err());
    assert_eq!(
      pairs("hset", &args(&["f1", "v1"])).unwrap(),
      vec![("f1".to_string(), "v1".to_string())]
    );
  }

  #[test]
  fn test_parse_float_rejects_non_finite() {
    assert!(parse_float("nan").is_err());
    assert!(parse_float("inf").is_err());
    assert_eq!(parse_float("2.5").unwrap(), 2.5);
  }
}
