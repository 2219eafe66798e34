//! Cache store implementation

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::command::{format_score, CacheCommand, CacheReply, InsertPosition};
use super::entry::{CacheEntry, CacheValue};
use crate::error::CacheError;

/// Eviction policy when memory limit is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
  /// Least Recently Used
  #[default]
  Lru,
  /// Least Frequently Used
  Lfu,
  /// Random eviction
  Random,
  /// Don't evict, return error on memory limit
  NoEviction,
}

impl std::fmt::Display for EvictionPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EvictionPolicy::Lru => write!(f, "lru"),
      EvictionPolicy::Lfu => write!(f, "lfu"),
      EvictionPolicy::Random => write!(f, "random"),
      EvictionPolicy::NoEviction => write!(f, "noeviction"),
    }
  }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
  pub keys: usize,
  pub memory_used: usize,
  pub memory_limit: usize,
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub expired: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

/// A cache backend the sync engine drives
///
/// `execute_atomic` must run the whole batch without interleaving other
/// clients' commands and returns one reply per command.
#[async_trait]
pub trait CacheStore: Send + Sync {
  async fn execute(&self, cmd: CacheCommand) -> Result<CacheReply, CacheError>;

  async fn execute_atomic(&self, cmds: Vec<CacheCommand>) -> Result<Vec<CacheReply>, CacheError>;
}

type Keyspace = HashMap<String, CacheEntry>;

/// In-memory cache store implementation
pub struct InMemoryCacheStore {
  data: RwLock<Keyspace>,
  memory_used: AtomicUsize,
  memory_limit: usize,
  eviction_policy: EvictionPolicy,
  default_ttl: Option<Duration>,
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  expired: AtomicU64,
}

impl InMemoryCacheStore {
  pub fn new(
    memory_limit: usize,
    eviction_policy: EvictionPolicy,
    default_ttl: Option<Duration>,
  ) -> Self {
    Self {
      data: RwLock::new(HashMap::new()),
      memory_used: AtomicUsize::new(0),
      memory_limit,
      eviction_policy,
      default_ttl,
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      evictions: AtomicU64::new(0),
      expired: AtomicU64::new(0),
    }
  }

  /// Check and evict expired entries
  pub fn evict_expired(&self) -> usize {
    let mut data = self.data.write();
    let expired_keys: Vec<String> = data
      .iter()
      .filter(|(_, entry)| entry.is_expired())
      .map(|(k, _)| k.clone())
      .collect();

    let count = expired_keys.len();
    for key in expired_keys {
      if let Some(entry) = data.remove(&key) {
        self.release(entry.size(&key));
        self.expired.fetch_add(1, Ordering::Relaxed);
      }
    }
    count
  }

  /// Periodically purge expired keys until the store is dropped.
  pub fn spawn_expiry_sweep(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
    let store: Weak<Self> = Arc::downgrade(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
          break;
        };
        let purged = store.evict_expired();
        if purged > 0 {
          tracing::debug!("Purged {} expired cache keys", purged);
        }
      }
    })
  }

  pub fn info(&self) -> CacheStats {
    let data = self.data.read();
    CacheStats {
      keys: data.iter().filter(|(_, e)| !e.is_expired()).count(),
      memory_used: self.memory_used.load(Ordering::Relaxed),
      memory_limit: self.memory_limit,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      expired: self.expired.load(Ordering::Relaxed),
    }
  }

  pub fn dbsize(&self) -> usize {
    let data = self.data.read();
    data.iter().filter(|(_, e)| !e.is_expired()).count()
  }

  fn release(&self, bytes: usize) {
    let _ = self
      .memory_used
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
        Some(used.saturating_sub(bytes))
      });
  }

  /// Evict entries to free memory (based on policy). Keys the pending
  /// command touches are never chosen.
  fn make_room(&self, data: &mut Keyspace, protected: &[&str]) -> Result<(), CacheError> {
    if self.memory_used.load(Ordering::Relaxed) < self.memory_limit {
      return Ok(());
    }
    if self.eviction_policy == EvictionPolicy::NoEviction {
      return Err(CacheError::OutOfMemory);
    }

    while self.memory_used.load(Ordering::Relaxed) >= self.memory_limit {
      let candidates = data.iter().filter(|(k, _)| !protected.contains(&k.as_str()));
      let key_to_evict = match self.eviction_policy {
        EvictionPolicy::Lru => candidates
          .min_by_key(|(_, entry)| entry.last_access)
          .map(|(k, _)| k.clone()),
        EvictionPolicy::Lfu => candidates
          .min_by_key(|(_, entry)| entry.hits)
          .map(|(k, _)| k.clone()),
        EvictionPolicy::Random => {
          let keys: Vec<_> = candidates.map(|(k, _)| k.clone()).collect();
          keys.choose(&mut rand::thread_rng()).cloned()
        }
        EvictionPolicy::NoEviction => None,
      };

      let Some(key) = key_to_evict else {
        return Err(CacheError::OutOfMemory);
      };
      if let Some(entry) = data.remove(&key) {
        self.release(entry.size(&key));
        self.evictions.fetch_add(1, Ordering::Relaxed);
      }
    }
    Ok(())
  }

  /// Live entry for `key`, purging it first if it has expired
  fn lookup<'a>(&self, data: &'a mut Keyspace, key: &str) -> Option<&'a mut CacheEntry> {
    // Memory is settled by `apply`, which measures the key before and after.
    if data.get(key).is_some_and(CacheEntry::is_expired) {
      data.remove(key);
      self.expired.fetch_add(1, Ordering::Relaxed);
    }
    match data.get_mut(key) {
      Some(entry) => {
        entry.record_access();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
      }
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  /// Live entry for `key`, created with `init` when absent
  fn lookup_or_insert<'a>(
    &self,
    data: &'a mut Keyspace,
    key: &str,
    init: impl FnOnce() -> CacheValue,
  ) -> &'a mut CacheEntry {
    // Purges an expired entry so the insert below starts fresh.
    let _ = self.lookup(data, key);
    data
      .entry(key.to_string())
      .or_insert_with(|| CacheEntry::new(init(), self.default_ttl))
  }

  /// Remove `key` if its aggregate became empty
  fn prune(data: &mut Keyspace, key: &str) {
    if data.get(key).is_some_and(|e| e.value.is_empty()) {
      data.remove(key);
    }
  }

  /// Apply one command with memory accounting
  fn apply(&self, data: &mut Keyspace, cmd: CacheCommand) -> Result<CacheReply, CacheError> {
    let keys: Vec<String> = cmd.keys().into_iter().map(str::to_string).collect();
    if cmd.may_grow() {
      let protected: Vec<&str> = keys.iter().map(String::as_str).collect();
      self.make_room(data, &protected)?;
    }

    let footprint = |data: &Keyspace| -> usize {
      keys
        .iter()
        .filter_map(|k| data.get(k).map(|e| e.size(k)))
        .sum()
    };
    let before = footprint(data);
    let reply = self.apply_unaccounted(data, cmd);
    let after = footprint(data);
    if after > before {
      self.memory_used.fetch_add(after - before, Ordering::Relaxed);
    } else {
      self.release(before - after);
    }
    reply
  }

  fn apply_unaccounted(
    &self,
    data: &mut Keyspace,
    cmd: CacheCommand,
  ) -> Result<CacheReply, CacheError> {
    match cmd {
      CacheCommand::Get { key } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Nil),
        Some(entry) => Ok(CacheReply::Bulk(string_ref(entry)?.clone())),
      },
      CacheCommand::Set { key, value, nx } => {
        if nx && self.lookup(data, &key).is_some() {
          return Ok(CacheReply::Nil);
        }
        data.insert(key, CacheEntry::new(CacheValue::String(value), self.default_ttl));
        Ok(CacheReply::ok())
      }
      CacheCommand::Incr { key } => self.incr_by(data, &key, 1),
      CacheCommand::Decr { key } => self.incr_by(data, &key, -1),
      CacheCommand::Exists { key } => Ok(CacheReply::Integer(
        self.lookup(data, &key).is_some() as i64,
      )),
      CacheCommand::Del { keys } => {
        let mut removed = 0;
        for key in keys {
          if self.lookup(data, &key).is_some() {
            data.remove(&key);
            removed += 1;
          }
        }
        Ok(CacheReply::Integer(removed))
      }
      CacheCommand::Rename { from, to } => {
        if self.lookup(data, &from).is_none() {
          return Err(CacheError::Command("no such key".to_string()));
        }
        if let Some(entry) = data.remove(&from) {
          data.insert(to, entry);
        }
        Ok(CacheReply::ok())
      }
      CacheCommand::Expire { key, ttl } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Integer(0)),
        Some(_) if ttl.is_zero() => {
          data.remove(&key);
          Ok(CacheReply::Integer(1))
        }
        Some(entry) => {
          entry.expire_in(ttl)?;
          Ok(CacheReply::Integer(1))
        }
      },
      CacheCommand::Ttl { key } => Ok(CacheReply::Integer(match self.lookup(data, &key) {
        None => -2,
        Some(entry) => entry
          .ttl_remaining()
          .map(|d| d.as_secs() as i64)
          .unwrap_or(-1),
      })),

      CacheCommand::LPush { ref values, .. } | CacheCommand::RPush { ref values, .. }
        if values.is_empty() =>
      {
        Err(CacheError::Command("wrong number of arguments".to_string()))
      }
      CacheCommand::LPush { key, values } => {
        let entry = self.lookup_or_insert(data, &key, || CacheValue::List(VecDeque::new()));
        let list = list_mut(entry)?;
        for value in values {
          list.push_front(value);
        }
        Ok(CacheReply::Integer(list.len() as i64))
      }
      CacheCommand::RPush { key, values } => {
        let entry = self.lookup_or_insert(data, &key, || CacheValue::List(VecDeque::new()));
        let list = list_mut(entry)?;
        list.extend(values);
        Ok(CacheReply::Integer(list.len() as i64))
      }
      CacheCommand::RPop { key } => {
        let popped = match self.lookup(data, &key) {
          None => None,
          Some(entry) => list_mut(entry)?.pop_back(),
        };
        Self::prune(data, &key);
        Ok(CacheReply::opt_bulk(popped))
      }
      CacheCommand::LIndex { key, index } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Nil),
        Some(entry) => {
          let list = list_mut(entry)?;
          Ok(CacheReply::opt_bulk(
            resolve_index(list.len(), index).and_then(|i| list.get(i).cloned()),
          ))
        }
      },
      CacheCommand::LSet { key, index, value } => {
        let entry = self
          .lookup(data, &key)
          .ok_or_else(|| CacheError::Command("no such key".to_string()))?;
        let list = list_mut(entry)?;
        let slot = resolve_index(list.len(), index)
          .and_then(|i| list.get_mut(i))
          .ok_or_else(|| CacheError::Command("index out of range".to_string()))?;
        *slot = value;
        Ok(CacheReply::ok())
      }
      CacheCommand::LInsert {
        key,
        position,
        pivot,
        value,
      } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Integer(0)),
        Some(entry) => {
          let list = list_mut(entry)?;
          match list.iter().position(|v| *v == pivot) {
            None => Ok(CacheReply::Integer(-1)),
            Some(at) => {
              let at = match position {
                InsertPosition::Before => at,
                InsertPosition::After => at + 1,
              };
              list.insert(at, value);
              Ok(CacheReply::Integer(list.len() as i64))
            }
          }
        }
      },
      CacheCommand::LRem { key, count, value } => {
        let removed = match self.lookup(data, &key) {
          None => 0,
          Some(entry) => remove_occurrences(list_mut(entry)?, count, &value),
        };
        Self::prune(data, &key);
        Ok(CacheReply::Integer(removed))
      }
      CacheCommand::LLen { key } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Integer(0)),
        Some(entry) => Ok(CacheReply::Integer(list_mut(entry)?.len() as i64)),
      },

      CacheCommand::SAdd { key, members } => {
        let entry = self.lookup_or_insert(data, &key, || CacheValue::Set(BTreeSet::new()));
        let set = set_mut(entry)?;
        let added = members.into_iter().filter(|m| set.insert(m.clone())).count();
        Self::prune(data, &key);
        Ok(CacheReply::Integer(added as i64))
      }
      CacheCommand::SRem { key, members } => {
        let removed = match self.lookup(data, &key) {
          None => 0,
          Some(entry) => {
            let set = set_mut(entry)?;
            members.iter().filter(|m| set.remove(*m)).count()
          }
        };
        Self::prune(data, &key);
        Ok(CacheReply::Integer(removed as i64))
      }
      CacheCommand::SMembers { key } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Array(Vec::new())),
        Some(entry) => Ok(CacheReply::strings(set_mut(entry)?.iter().cloned())),
      },
      CacheCommand::SIsMember { key, member } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Integer(0)),
        Some(entry) => Ok(CacheReply::Integer(set_mut(entry)?.contains(&member) as i64)),
      },
      CacheCommand::SCard { key } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Integer(0)),
        Some(entry) => Ok(CacheReply::Integer(set_mut(entry)?.len() as i64)),
      },

      CacheCommand::ZAdd { key, members, nx } => {
        if members.iter().any(|(score, _)| score.is_nan()) {
          return Err(CacheError::Command("value is not a valid float".to_string()));
        }
        let entry = self.lookup_or_insert(data, &key, || CacheValue::SortedSet(BTreeMap::new()));
        let zset = zset_mut(entry)?;
        let mut added = 0;
        for (score, member) in members {
          match zset.get_mut(&member) {
            Some(_) if nx => {}
            Some(existing) => *existing = score,
            None => {
              zset.insert(member, score);
              added += 1;
            }
          }
        }
        Self::prune(data, &key);
        Ok(CacheReply::Integer(added))
      }
      CacheCommand::ZIncrBy { key, delta, member } => {
        let entry = self.lookup_or_insert(data, &key, || CacheValue::SortedSet(BTreeMap::new()));
        let zset = zset_mut(entry)?;
        let score = zset.get(&member).copied().unwrap_or(0.0) + delta;
        if score.is_nan() {
          Self::prune(data, &key);
          return Err(CacheError::Command(
            "resulting score is not a number (NaN)".to_string(),
          ));
        }
        zset.insert(member, score);
        Ok(CacheReply::Bulk(format_score(score)))
      }
      CacheCommand::ZScore { key, member } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Nil),
        Some(entry) => Ok(CacheReply::opt_bulk(
          zset_mut(entry)?.get(&member).map(|s| format_score(*s)),
        )),
      },
      CacheCommand::ZRank { key, member } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Nil),
        Some(entry) => {
          let zset = zset_mut(entry)?;
          if !zset.contains_key(&member) {
            return Ok(CacheReply::Nil);
          }
          let rank = CacheValue::ranked(zset)
            .iter()
            .position(|(m, _)| **m == member);
          Ok(rank.map_or(CacheReply::Nil, |r| CacheReply::Integer(r as i64)))
        }
      },
      CacheCommand::ZRem { key, members } => {
        let removed = match self.lookup(data, &key) {
          None => 0,
          Some(entry) => {
            let zset = zset_mut(entry)?;
            members.iter().filter(|m| zset.remove(*m).is_some()).count()
          }
        };
        Self::prune(data, &key);
        Ok(CacheReply::Integer(removed as i64))
      }
      CacheCommand::ZRangeByScore { key, range, rev } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Array(Vec::new())),
        Some(entry) => Ok(CacheReply::strings(CacheValue::range_by_score(
          zset_mut(entry)?,
          &range,
          rev,
        ))),
      },

      CacheCommand::HSet { key, pairs } => {
        let entry = self.lookup_or_insert(data, &key, || CacheValue::Hash(BTreeMap::new()));
        let hash = hash_mut(entry)?;
        let mut added = 0;
        for (field, value) in pairs {
          if hash.insert(field, value).is_none() {
            added += 1;
          }
        }
        Self::prune(data, &key);
        Ok(CacheReply::Integer(added))
      }
      CacheCommand::HGet { key, field } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Nil),
        Some(entry) => Ok(CacheReply::opt_bulk(hash_mut(entry)?.get(&field).cloned())),
      },
      CacheCommand::HMGet { key, fields } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Array(vec![CacheReply::Nil; fields.len()])),
        Some(entry) => {
          let hash = hash_mut(entry)?;
          Ok(CacheReply::Array(
            fields
              .iter()
              .map(|f| CacheReply::opt_bulk(hash.get(f).cloned()))
              .collect(),
          ))
        }
      },
      CacheCommand::HGetAll { key } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Array(Vec::new())),
        Some(entry) => Ok(CacheReply::strings(
          hash_mut(entry)?
            .iter()
            .flat_map(|(f, v)| [f.clone(), v.clone()]),
        )),
      },
      CacheCommand::HExists { key, field } => match self.lookup(data, &key) {
        None => Ok(CacheReply::Integer(0)),
        Some(entry) => Ok(CacheReply::Integer(
          hash_mut(entry)?.contains_key(&field) as i64,
        )),
      },
      CacheCommand::HDel { key, fields } => {
        let removed = match self.lookup(data, &key) {
          None => 0,
          Some(entry) => {
            let hash = hash_mut(entry)?;
            fields.iter().filter(|f| hash.remove(*f).is_some()).count()
          }
        };
        Self::prune(data, &key);
        Ok(CacheReply::Integer(removed as i64))
      }
    }
  }

  fn incr_by(&self, data: &mut Keyspace, key: &str, delta: i64) -> Result<CacheReply, CacheError> {
    let entry = self.lookup_or_insert(data, key, || CacheValue::String("0".to_string()));
    let value = match &mut entry.value {
      CacheValue::String(s) => s,
      _ => return Err(CacheError::WrongType),
    };
    let next = value
      .parse::<i64>()
      .ok()
      .and_then(|current| current.checked_add(delta))
      .ok_or_else(|| CacheError::Command("value is not an integer or out of range".to_string()))?;
    *value = next.to_string();
    Ok(CacheReply::Integer(next))
  }
}

impl Default for InMemoryCacheStore {
  fn default() -> Self {
    Self::new(usize::MAX, EvictionPolicy::default(), None)
  }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
  async fn execute(&self, cmd: CacheCommand) -> Result<CacheReply, CacheError> {
    let mut data = self.data.write();
    self.apply(&mut data, cmd)
  }

  /// Commands before a failing one stay applied, matching `EXEC`.
  async fn execute_atomic(&self, cmds: Vec<CacheCommand>) -> Result<Vec<CacheReply>, CacheError> {
    let mut data = self.data.write();
    cmds
      .into_iter()
      .map(|cmd| self.apply(&mut data, cmd))
      .collect()
  }
}

fn string_ref(entry: &CacheEntry) -> Result<&String, CacheError> {
  match &entry.value {
    CacheValue::String(s) => Ok(s),
    _ => Err(CacheError::WrongType),
  }
}

fn list_mut(entry: &mut CacheEntry) -> Result<&mut VecDeque<String>, CacheError> {
  match &mut entry.value {
    CacheValue::List(l) => Ok(l),
    _ => Err(CacheError::WrongType),
  }
}

fn set_mut(entry: &mut CacheEntry) -> Result<&mut BTreeSet<String>, CacheError> {
  match &mut entry.value {
    CacheValue::Set(s) => Ok(s),
    _ => Err(CacheError::WrongType),
  }
}

fn zset_mut(entry: &mut CacheEntry) -> Result<&mut BTreeMap<String, f64>, CacheError> {
  match &mut entry.value {
    CacheValue::SortedSet(z) => Ok(z),
    _ => Err(CacheError::WrongType),
  }
}

fn hash_mut(entry: &mut CacheEntry) -> Result<&mut BTreeMap<String, String>, CacheError> {
  match &mut entry.value {
    CacheValue::Hash(h) => Ok(h),
    _ => Err(CacheError::WrongType),
  }
}

/// Redis list index (negative counts from the tail) to a position
fn resolve_index(len: usize, index: i64) -> Option<usize> {
  let len = len as i64;
  let i = if index < 0 { len + index } else { index };
  (0..len).contains(&i).then_some(i as usize)
}

/// `LREM` semantics: `count > 0` from the head, `< 0` from the tail, `0` all
fn remove_occurrences(list: &mut VecDeque<String>, count: i64, value: &str) -> i64 {
  let limit = if count == 0 {
    usize::MAX
  } else {
    count.unsigned_abs() as usize
  };
  let mut removed = 0usize;
  if count >= 0 {
    let mut i = 0;
    while i < list.len() && removed < limit {
      if list[i] == value {
        list.remove(i);
        removed += 1;
      } else {
        i += 1;
      }
    }
  } else {
    let mut i = list.len();
    while i > 0 && removed < limit {
      i -= 1;
      if list[i] == value {
        list.remove(i);
        removed += 1;
      }
    }
  }
  removed as i64
}
