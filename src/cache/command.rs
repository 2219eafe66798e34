//! Cache command and reply types
//!
//! Commands are plain data so a backend can run a sequence of them as one
//! atomic block (`MULTI`/`EXEC` on Redis, a single lock on the builtin store).

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::CacheError;

/// Which side of a pivot `LINSERT` inserts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
  Before,
  After,
}

/// Score bound for range queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
  NegInfinity,
  PosInfinity,
  Inclusive(f64),
  Exclusive(f64),
}

impl ScoreBound {
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "-inf" | "-INF" => Some(ScoreBound::NegInfinity),
      "+inf" | "inf" | "+INF" | "INF" => Some(ScoreBound::PosInfinity),
      _ => match s.strip_prefix('(') {
        Some(rest) => rest
          .parse::<f64>()
          .ok()
          .filter(|f| !f.is_nan())
          .map(ScoreBound::Exclusive),
        None => s
          .parse::<f64>()
          .ok()
          .filter(|f| !f.is_nan())
          .map(ScoreBound::Inclusive),
      },
    }
  }

  /// Whether `score` satisfies this bound used as a lower limit
  pub fn admits_above(&self, score: f64) -> bool {
    match self {
      ScoreBound::NegInfinity => true,
      ScoreBound::PosInfinity => false,
      ScoreBound::Inclusive(b) => score >= *b,
      ScoreBound::Exclusive(b) => score > *b,
    }
  }

  /// Whether `score` satisfies this bound used as an upper limit
  pub fn admits_below(&self, score: f64) -> bool {
    match self {
      ScoreBound::NegInfinity => false,
      ScoreBound::PosInfinity => true,
      ScoreBound::Inclusive(b) => score <= *b,
      ScoreBound::Exclusive(b) => score < *b,
    }
  }

  pub fn to_arg(&self) -> String {
    match self {
      ScoreBound::NegInfinity => "-inf".to_string(),
      ScoreBound::PosInfinity => "+inf".to_string(),
      ScoreBound::Inclusive(b) => format_score(*b),
      ScoreBound::Exclusive(b) => format!("({}", format_score(*b)),
    }
  }
}

/// Arguments of `ZRANGEBYSCORE` / `ZREVRANGEBYSCORE`. `min`/`max` keep their
/// meaning in both directions.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRange {
  pub min: ScoreBound,
  pub max: ScoreBound,
  pub with_scores: bool,
  /// `LIMIT offset count`; a negative count means "all remaining"
  pub limit: Option<(usize, i64)>,
}

impl ScoreRange {
  pub fn new(min: ScoreBound, max: ScoreBound) -> Self {
    Self {
      min,
      max,
      with_scores: false,
      limit: None,
    }
  }

  pub fn all() -> Self {
    Self::new(ScoreBound::NegInfinity, ScoreBound::PosInfinity)
  }

  pub fn with_scores(mut self) -> Self {
    self.with_scores = true;
    self
  }

  pub fn limit(mut self, offset: usize, count: i64) -> Self {
    self.limit = Some((offset, count));
    self
  }

  pub fn contains(&self, score: f64) -> bool {
    self.min.admits_above(score) && self.max.admits_below(score)
  }
}

/// Redis-style score formatting (`70`, `81.5`, `inf`)
pub fn format_score(score: f64) -> String {
  if score.is_infinite() {
    if score > 0.0 { "inf" } else { "-inf" }.to_string()
  } else {
    score.to_string()
  }
}

/// One cache command
#[derive(Debug, Clone, PartialEq)]
pub enum CacheCommand {
  Get { key: String },
  Set { key: String, value: String, nx: bool },
  Incr { key: String },
  Decr { key: String },
  Exists { key: String },
  Del { keys: Vec<String> },
  Rename { from: String, to: String },
  Expire { key: String, ttl: Duration },
  Ttl { key: String },

  LPush { key: String, values: Vec<String> },
  RPush { key: String, values: Vec<String> },
  RPop { key: String },
  LIndex { key: String, index: i64 },
  LSet { key: String, index: i64, value: String },
  LInsert { key: String, position: InsertPosition, pivot: String, value: String },
  LRem { key: String, count: i64, value: String },
  LLen { key: String },

  SAdd { key: String, members: Vec<String> },
  SRem { key: String, members: Vec<String> },
  SMembers { key: String },
  SIsMember { key: String, member: String },
  SCard { key: String },

  ZAdd { key: String, members: Vec<(f64, String)>, nx: bool },
  ZIncrBy { key: String, delta: f64, member: String },
  ZScore { key: String, member: String },
  ZRank { key: String, member: String },
  ZRem { key: String, members: Vec<String> },
  ZRangeByScore { key: String, range: ScoreRange, rev: bool },

  HSet { key: String, pairs: Vec<(String, String)> },
  HGet { key: String, field: String },
  HMGet { key: String, fields: Vec<String> },
  HGetAll { key: String },
  HExists { key: String, field: String },
  HDel { key: String, fields: Vec<String> },
}

impl CacheCommand {
  pub fn name(&self) -> &'static str {
    match self {
      CacheCommand::Get { .. } => "GET",
      CacheCommand::Set { .. } => "SET",
      CacheCommand::Incr { .. } => "INCR",
      CacheCommand::Decr { .. } => "DECR",
      CacheCommand::Exists { .. } => "EXISTS",
      CacheCommand::Del { .. } => "DEL",
      CacheCommand::Rename { .. } => "RENAME",
      CacheCommand::Expire { .. } => "EXPIRE",
      CacheCommand::Ttl { .. } => "TTL",
      CacheCommand::LPush { .. } => "LPUSH",
      CacheCommand::RPush { .. } => "RPUSH",
      CacheCommand::RPop { .. } => "RPOP",
      CacheCommand::LIndex { .. } => "LINDEX",
      CacheCommand::LSet { .. } => "LSET",
      CacheCommand::LInsert { .. } => "LINSERT",
      CacheCommand::LRem { .. } => "LREM",
      CacheCommand::LLen { .. } => "LLEN",
      CacheCommand::SAdd { .. } => "SADD",
      CacheCommand::SRem { .. } => "SREM",
      CacheCommand::SMembers { .. } => "SMEMBERS",
      CacheCommand::SIsMember { .. } => "SISMEMBER",
      CacheCommand::SCard { .. } => "SCARD",
      CacheCommand::ZAdd { .. } => "ZADD",
      CacheCommand::ZIncrBy { .. } => "ZINCRBY",
      CacheCommand::ZScore { .. } => "ZSCORE",
      CacheCommand::ZRank { .. } => "ZRANK",
      CacheCommand::ZRem { .. } => "ZREM",
      CacheCommand::ZRangeByScore { rev: false, .. } => "ZRANGEBYSCORE",
      CacheCommand::ZRangeByScore { rev: true, .. } => "ZREVRANGEBYSCORE",
      CacheCommand::HSet { .. } => "HSET",
      CacheCommand::HGet { .. } => "HGET",
      CacheCommand::HMGet { .. } => "HMGET",
      CacheCommand::HGetAll { .. } => "HGETALL",
      CacheCommand::HExists { .. } => "HEXISTS",
      CacheCommand::HDel { .. } => "HDEL",
    }
  }

  /// Keys the command reads or writes
  pub fn keys(&self) -> Vec<&str> {
    match self {
      CacheCommand::Del { keys } => keys.iter().map(String::as_str).collect(),
      CacheCommand::Rename { from, to } => vec![from.as_str(), to.as_str()],
      CacheCommand::Get { key }
      | CacheCommand::Set { key, .. }
      | CacheCommand::Incr { key }
      | CacheCommand::Decr { key }
      | CacheCommand::Exists { key }
      | CacheCommand::Expire { key, .. }
      | CacheCommand::Ttl { key }
      | CacheCommand::LPush { key, .. }
      | CacheCommand::RPush { key, .. }
      | CacheCommand::RPop { key }
      | CacheCommand::LIndex { key, .. }
      | CacheCommand::LSet { key, .. }
      | CacheCommand::LInsert { key, .. }
      | CacheCommand::LRem { key, .. }
      | CacheCommand::LLen { key }
      | CacheCommand::SAdd { key, .. }
      | CacheCommand::SRem { key, .. }
      | CacheCommand::SMembers { key }
      | CacheCommand::SIsMember { key, .. }
      | CacheCommand::SCard { key }
      | CacheCommand::ZAdd { key, .. }
      | CacheCommand::ZIncrBy { key, .. }
      | CacheCommand::ZScore { key, .. }
      | CacheCommand::ZRank { key, .. }
      | CacheCommand::ZRem { key, .. }
      | CacheCommand::ZRangeByScore { key, .. }
      | CacheCommand::HSet { key, .. }
      | CacheCommand::HGet { key, .. }
      | CacheCommand::HMGet { key, .. }
      | CacheCommand::HGetAll { key }
      | CacheCommand::HExists { key, .. }
      | CacheCommand::HDel { key, .. } => vec![key.as_str()],
    }
  }

  /// Whether the command can grow the keyspace (subject to `maxmemory`)
  pub fn may_grow(&self) -> bool {
    matches!(
      self,
      CacheCommand::Set { .. }
        | CacheCommand::Incr { .. }
        | CacheCommand::Decr { .. }
        | CacheCommand::LPush { .. }
        | CacheCommand::RPush { .. }
        | CacheCommand::LSet { .. }
        | CacheCommand::LInsert { .. }
        | CacheCommand::SAdd { .. }
        | CacheCommand::ZAdd { .. }
        | CacheCommand::ZIncrBy { .. }
        | CacheCommand::HSet { .. }
    )
  }

  /// Redis wire arguments (everything after the command name)
  pub fn args(&self) -> Vec<String> {
    match self {
      CacheCommand::Get { key }
      | CacheCommand::Incr { key }
      | CacheCommand::Decr { key }
      | CacheCommand::Exists { key }
      | CacheCommand::Ttl { key }
      | CacheCommand::RPop { key }
      | CacheCommand::LLen { key }
      | CacheCommand::SMembers { key }
      | CacheCommand::SCard { key }
      | CacheCommand::HGetAll { key } => vec![key.clone()],
      CacheCommand::Set { key, value, nx } => {
        let mut args = vec![key.clone(), value.clone()];
        if *nx {
          args.push("NX".to_string());
        }
        args
      }
      CacheCommand::Del { keys } => keys.clone(),
      CacheCommand::Rename { from, to } => vec![from.clone(), to.clone()],
      CacheCommand::Expire { key, ttl } => vec![key.clone(), ttl.as_secs().to_string()],
      CacheCommand::LPush { key, values }
      | CacheCommand::RPush { key, values }
      | CacheCommand::SAdd {
        key,
        members: values,
      }
      | CacheCommand::SRem {
        key,
        members: values,
      }
      | CacheCommand::ZRem {
        key,
        members: values,
      }
      | CacheCommand::HMGet {
        key,
        fields: values,
      }
      | CacheCommand::HDel {
        key,
        fields: values,
      } => std::iter::once(key.clone())
        .chain(values.iter().cloned())
        .collect(),
      CacheCommand::LIndex { key, index } => vec![key.clone(), index.to_string()],
      CacheCommand::LSet { key, index, value } => {
        vec![key.clone(), index.to_string(), value.clone()]
      }
      CacheCommand::LInsert {
        key,
        position,
        pivot,
        value,
      } => vec![
        key.clone(),
        match position {
          InsertPosition::Before => "BEFORE".to_string(),
          InsertPosition::After => "AFTER".to_string(),
        },
        pivot.clone(),
        value.clone(),
      ],
      CacheCommand::LRem { key, count, value } => {
        vec![key.clone(), count.to_string(), value.clone()]
      }
      CacheCommand::SIsMember { key, member }
      | CacheCommand::ZScore { key, member }
      | CacheCommand::ZRank { key, member } => vec![key.clone(), member.clone()],
      CacheCommand::ZAdd { key, members, nx } => {
        let mut args = vec![key.clone()];
        if *nx {
          args.push("NX".to_string());
        }
        for (score, member) in members {
          args.push(format_score(*score));
          args.push(member.clone());
        }
        args
      }
      CacheCommand::ZIncrBy { key, delta, member } => {
        vec![key.clone(), format_score(*delta), member.clone()]
      }
      CacheCommand::ZRangeByScore { key, range, rev } => {
        let (first, second) = if *rev {
          (range.max, range.min)
        } else {
          (range.min, range.max)
        };
        let mut args = vec![key.clone(), first.to_arg(), second.to_arg()];
        if range.with_scores {
          args.push("WITHSCORES".to_string());
        }
        if let Some((offset, count)) = range.limit {
          args.push("LIMIT".to_string());
          args.push(offset.to_string());
          args.push(count.to_string());
        }
        args
      }
      CacheCommand::HSet { key, pairs } => {
        let mut args = vec![key.clone()];
        for (field, value) in pairs {
          args.push(field.clone());
          args.push(value.clone());
        }
        args
      }
      CacheCommand::HGet { key, field } | CacheCommand::HExists { key, field } => {
        vec![key.clone(), field.clone()]
      }
    }
  }
}

/// A cache reply, shaped like RESP replies
#[derive(Debug, Clone, PartialEq)]
pub enum CacheReply {
  Nil,
  Status(String),
  Integer(i64),
  Bulk(String),
  Array(Vec<CacheReply>),
}

impl CacheReply {
  pub fn ok() -> Self {
    CacheReply::Status("OK".to_string())
  }

  pub fn bulk(s: impl Into<String>) -> Self {
    CacheReply::Bulk(s.into())
  }

  pub fn opt_bulk(s: Option<String>) -> Self {
    s.map(CacheReply::Bulk).unwrap_or(CacheReply::Nil)
  }

  pub fn strings(items: impl IntoIterator<Item = String>) -> Self {
    CacheReply::Array(items.into_iter().map(CacheReply::Bulk).collect())
  }

  pub fn is_nil(&self) -> bool {
    matches!(self, CacheReply::Nil)
  }

  pub fn into_opt_string(self) -> Result<Option<String>, CacheError> {
    match self {
      CacheReply::Nil => Ok(None),
      CacheReply::Bulk(s) | CacheReply::Status(s) => Ok(Some(s)),
      CacheReply::Integer(i) => Ok(Some(i.to_string())),
      other => Err(CacheError::UnexpectedReply(format!("{:?}", other))),
    }
  }

  pub fn into_integer(self) -> Result<i64, CacheError> {
    match self {
      CacheReply::Integer(i) => Ok(i),
      CacheReply::Bulk(s) | CacheReply::Status(s) => s
        .parse()
        .map_err(|_| CacheError::UnexpectedReply(s)),
      CacheReply::Nil => Ok(0),
      other => Err(CacheError::UnexpectedReply(format!("{:?}", other))),
    }
  }

  pub fn into_opt_integer(self) -> Result<Option<i64>, CacheError> {
    match self {
      CacheReply::Nil => Ok(None),
      other => other.into_integer().map(Some),
    }
  }

  pub fn into_items(self) -> Result<Vec<CacheReply>, CacheError> {
    match self {
      CacheReply::Array(items) => Ok(items),
      CacheReply::Nil => Ok(Vec::new()),
      other => Err(CacheError::UnexpectedReply(format!("{:?}", other))),
    }
  }

  pub fn into_strings(self) -> Result<Vec<String>, CacheError> {
    self
      .into_items()?
      .into_iter()
      .map(|item| {
        item
          .into_opt_string()?
          .ok_or_else(|| CacheError::UnexpectedReply("nil array element".to_string()))
      })
      .collect()
  }

  pub fn into_opt_strings(self) -> Result<Vec<Option<String>>, CacheError> {
    self
      .into_items()?
      .into_iter()
      .map(CacheReply::into_opt_string)
      .collect()
  }

  /// Flat `[field, value, field, value]` into a map
  pub fn into_map(self) -> Result<BTreeMap<String, String>, CacheError> {
    let flat = self.into_strings()?;
    Ok(
      flat
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect(),
    )
  }
}

impl std::fmt::Display for CacheReply {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheReply::Nil => write!(f, "(nil)"),
      CacheReply::Status(s) => write!(f, "{}", s),
      CacheReply::Integer(i) => write!(f, "(integer) {}", i),
      CacheReply::Bulk(s) => write!(f, "\"{}\"", s),
      CacheReply::Array(items) if items.is_empty() => write!(f, "(empty array)"),
      CacheReply::Array(items) => {
        for (i, item) in items.iter().enumerate() {
          if i > 0 {
            writeln!(f)?;
          }
          write!(f, "{}) {}", i + 1, item)?;
        }
        Ok(())
      }
    }
  }
}
