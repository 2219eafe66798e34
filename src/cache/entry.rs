//! Values held by the builtin store

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use super::command::{format_score, ScoreRange};
use crate::error::CacheError;
use crate::keys::StructureKind;

/// One keyspace slot: the value plus what expiry and eviction look at
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub value: CacheValue,
  pub deadline: Option<Instant>,
  pub last_access: Instant,
  pub hits: u64,
}

impl CacheEntry {
  pub fn new(value: CacheValue, ttl: Option<Duration>) -> Self {
    let last_access = Instant::now();
    Self {
      value,
      deadline: ttl.and_then(|ttl| last_access.checked_add(ttl)),
      last_access,
      hits: 0,
    }
  }

  pub fn is_expired(&self) -> bool {
    self.deadline.is_some_and(|at| at < Instant::now())
  }

  /// Time left before expiry; `None` without a TTL or once it has passed
  pub fn ttl_remaining(&self) -> Option<Duration> {
    self.deadline?.checked_duration_since(Instant::now())
  }

  pub fn record_access(&mut self) {
    self.last_access = Instant::now();
    self.hits += 1;
  }

  /// Fails when the deadline is past what the clock can represent.
  pub fn expire_in(&mut self, ttl: Duration) -> Result<(), CacheError> {
    let at = Instant::now()
      .checked_add(ttl)
      .ok_or_else(|| CacheError::Command("invalid expire time in 'expire' command".to_string()))?;
    self.deadline = Some(at);
    Ok(())
  }

  /// Approximate footprint, key included
  pub fn size(&self, key: &str) -> usize {
    key.len() + self.value.approximate_size()
  }
}

/// Native cache structures
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
  String(String),
  List(VecDeque<String>),
  Set(BTreeSet<String>),
  SortedSet(BTreeMap<String, f64>),
  Hash(BTreeMap<String, String>),
}

impl CacheValue {
  pub fn kind(&self) -> StructureKind {
    match self {
      CacheValue::String(_) => StructureKind::String,
      CacheValue::List(_) => StructureKind::List,
      CacheValue::Set(_) => StructureKind::Set,
      CacheValue::SortedSet(_) => StructureKind::SortedSet,
      CacheValue::Hash(_) => StructureKind::Hash,
    }
  }

  /// Empty aggregates are removed from the keyspace, like Redis does.
  pub fn is_empty(&self) -> bool {
    match self {
      CacheValue::String(_) => false,
      CacheValue::List(l) => l.is_empty(),
      CacheValue::Set(s) => s.is_empty(),
      CacheValue::SortedSet(z) => z.is_empty(),
      CacheValue::Hash(h) => h.is_empty(),
    }
  }

  pub fn approximate_size(&self) -> usize {
    match self {
      CacheValue::String(s) => s.len(),
      CacheValue::List(l) => l.iter().map(|v| v.len() + 8).sum(),
      CacheValue::Set(s) => s.iter().map(|m| m.len() + 8).sum(),
      CacheValue::SortedSet(z) => z.keys().map(|m| m.len() + 16).sum(),
      CacheValue::Hash(h) => h.iter().map(|(f, v)| f.len() + v.len() + 8).sum(),
    }
  }

  /// Sorted-set members ordered by (score, member), Redis order
  pub fn ranked(members: &BTreeMap<String, f64>) -> Vec<(&String, f64)> {
    let mut ranked: Vec<(&String, f64)> = members.iter().map(|(m, s)| (m, *s)).collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    ranked
  }

  /// `ZRANGEBYSCORE` / `ZREVRANGEBYSCORE` over a member map, scores
  /// interleaved when the range asks for them
  pub fn range_by_score(members: &BTreeMap<String, f64>, range: &ScoreRange, rev: bool) -> Vec<String> {
    let mut hits: Vec<(&String, f64)> = Self::ranked(members)
      .into_iter()
      .filter(|(_, score)| range.contains(*score))
      .collect();
    if rev {
      hits.reverse();
    }
    let (offset, take) = match range.limit {
      None => (0, usize::MAX),
      Some((offset, count)) if count < 0 => (offset, usize::MAX),
      Some((offset, count)) => (offset, count as usize),
    };
    let mut out = Vec::new();
    for (member, score) in hits.into_iter().skip(offset).take(take) {
      out.push(member.clone());
      if range.with_scores {
        out.push(format_score(score));
      }
    }
    out
  }
}
