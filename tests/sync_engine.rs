use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use shadowsync::cache::{CacheCommand, CacheReply, CacheStore, InMemoryCacheStore, ScoreBound, ScoreRange};
use shadowsync::config::PrefixConfig;
use shadowsync::db::{DurableStore, OnConflict, Row, SqlBuilder, SqlDialect, SqlValue, SqliteBackend, Statement};
use shadowsync::{DurableError, FailedStore, StructureKind, SyncEngine, SyncError};

/// Durable store that can be told to fail every write transaction, or only
/// those touching a given piece of SQL
struct FaultyStore {
  inner: SqliteBackend,
  fail_writes: AtomicBool,
  fail_matching: Mutex<Option<&'static str>>,
}

#[async_trait]
impl DurableStore for FaultyStore {
  fn dialect(&self) -> SqlDialect {
    self.inner.dialect()
  }

  async fn execute(&self, stmt: Statement) -> Result<u64, DurableError> {
    self.inner.execute(stmt).await
  }

  async fn query(&self, stmt: Statement) -> Result<Vec<Row>, DurableError> {
    self.inner.query(stmt).await
  }

  async fn transaction(&self, stmts: Vec<Statement>) -> Result<(), DurableError> {
    let matched = match *self.fail_matching.lock() {
      Some(needle) => stmts.iter().any(|s| s.sql.contains(needle)),
      None => false,
    };
    if matched || self.fail_writes.load(Ordering::SeqCst) {
      return Err(DurableError::Query("injected write failure".to_string()));
    }
    self.inner.transaction(stmts).await
  }
}

struct Harness {
  engine: Arc<SyncEngine>,
  cache: Arc<InMemoryCacheStore>,
  durable: Arc<FaultyStore>,
}

async fn harness() -> Harness {
  let cache = Arc::new(InMemoryCacheStore::default());
  let durable = Arc::new(FaultyStore {
    inner: SqliteBackend::in_memory().await.unwrap(),
    fail_writes: AtomicBool::new(false),
    fail_matching: Mutex::new(None),
  });
  let engine = Arc::new(
    SyncEngine::new(&PrefixConfig::default(), cache.clone(), durable.clone()).unwrap(),
  );
  Harness {
    engine,
    cache,
    durable,
  }
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Harness {
  fn fail_writes(&self) {
    self.durable.fail_writes.store(true, Ordering::SeqCst);
  }

  fn fail_transactions_containing(&self, needle: &'static str) {
    *self.durable.fail_matching.lock() = Some(needle);
  }

  async fn rows(&self, sql: &str) -> Result<Vec<Row>, DurableError> {
    self.durable.query(Statement::bare(sql)).await
  }

  async fn texts(&self, sql: &str) -> Vec<String> {
    self
      .rows(sql)
      .await
      .unwrap()
      .iter()
      .filter_map(|r| r.text(0))
      .collect()
  }

  async fn cached(&self, cmd: CacheCommand) -> CacheReply {
    self.cache.execute(cmd).await.unwrap()
  }

  async fn evict(&self, key: &str) {
    self
      .cached(CacheCommand::Del {
        keys: vec![key.to_string()],
      })
      .await;
  }

  /// Seed a shadow table directly, bypassing the cache.
  async fn seed(&self, table: &str, kind: StructureKind, rows: Vec<Vec<SqlValue>>) {
    let sql = SqlBuilder::new(SqlDialect::Sqlite);
    self.durable.execute(sql.create_table(table, kind).unwrap()).await.unwrap();
    self
      .durable
      .execute(sql.build_upsert(table, kind, rows, OnConflict::Replace).unwrap())
      .await
      .unwrap();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_writes_share_one_table() {
  let h = harness().await;
  let mut failures = h.engine.subscribe_failures();

  let mut handles = Vec::new();
  for i in 0..16 {
    let engine = h.engine.clone();
    handles.push(tokio::spawn(async move {
      engine.sets().sadd("set:tags", &[format!("m{}", i)]).await
    }));
  }
  for handle in handles {
    assert_eq!(handle.await.unwrap().unwrap(), 1);
  }
  h.engine.settle().await;

  assert!(failures.try_recv().is_err());
  let members = h.texts("SELECT member FROM \"set_tags\"").await;
  assert_eq!(members.len(), 16);
}

#[tokio::test]
async fn test_set_get_del_round_trip() {
  let h = harness().await;
  let strs = h.engine.strings();

  strs.set("users", "42", "alice").await.unwrap();
  assert_eq!(strs.get("users", "42").await.unwrap().as_deref(), Some("alice"));
  h.engine.settle().await;
  assert_eq!(
    h.texts("SELECT value FROM \"str_users\" WHERE key = '42'").await,
    vec!["alice"]
  );

  let removed = h.engine.keyspace().del(&strings(&["str:users:42"])).await.unwrap();
  assert_eq!(removed, 1);
  h.engine.settle().await;

  assert_eq!(strs.get("users", "42").await.unwrap(), None);
  // The last row left, so the table went with it.
  assert!(matches!(
    h.rows("SELECT value FROM \"str_users\"").await,
    Err(DurableError::MissingTable(_))
  ));
}

#[tokio::test]
async fn test_read_through_backfills_cache() {
  let h = harness().await;
  h.seed(
    "str_users",
    StructureKind::String,
    vec![vec![SqlValue::from("7"), SqlValue::from("grace")]],
  )
  .await;

  let value = h.engine.strings().get("users", "7").await.unwrap();
  assert_eq!(value.as_deref(), Some("grace"));
  h.engine.settle().await;

  let cached = h
    .cached(CacheCommand::Get {
      key: "str:users:7".to_string(),
    })
    .await;
  assert_eq!(cached, CacheReply::bulk("grace"));
}

#[tokio::test]
async fn test_incr_seeds_from_durable_value() {
  let h = harness().await;
  h.seed(
    "str_hits",
    StructureKind::String,
    vec![vec![SqlValue::from("home"), SqlValue::from("5")]],
  )
  .await;

  assert_eq!(h.engine.strings().incr("hits", "home").await.unwrap(), 6);
  assert_eq!(h.engine.strings().incr("hits", "home").await.unwrap(), 7);
  h.engine.settle().await;
  assert_eq!(
    h.texts("SELECT value FROM \"str_hits\" WHERE key = 'home'").await,
    vec!["7"]
  );
}

#[tokio::test]
async fn test_sadd_compensates_on_durable_failure() {
  let h = harness().await;
  let mut failures = h.engine.subscribe_failures();
  h.fail_writes();

  let added = h.engine.sets().sadd("set:tags", &strings(&["rust"])).await.unwrap();
  assert_eq!(added, 1);
  h.engine.settle().await;

  let member = h
    .cached(CacheCommand::SIsMember {
      key: "set:tags".to_string(),
      member: "rust".to_string(),
    })
    .await;
  assert_eq!(member, CacheReply::Integer(0));

  let failure = failures.try_recv().unwrap();
  assert_eq!(failure.store, FailedStore::Durable);
  assert_eq!(failure.key, "set:tags");
  assert!(failure.message.contains("injected"));
}

#[tokio::test]
async fn test_compensation_keeps_earlier_members() {
  let h = harness().await;
  let sets = h.engine.sets();
  sets.sadd("set:tags", &strings(&["a"])).await.unwrap();
  h.engine.settle().await;

  h.fail_writes();
  sets.sadd("set:tags", &strings(&["a", "b"])).await.unwrap();
  h.engine.settle().await;

  let mut members = sets.smembers("set:tags").await.unwrap();
  members.sort();
  assert_eq!(members, vec!["a"]);
}

#[tokio::test]
async fn test_list_index_symmetry() {
  let h = harness().await;
  let lists = h.engine.lists();
  for value in ["300", "name1", "name2", "400"] {
    lists.lpush("lst:names", &[value.to_string()]).await.unwrap();
  }
  h.engine.settle().await;

  let expected = ["400", "name2", "name1", "300"];
  for (i, want) in expected.iter().enumerate() {
    let i = i as i64;
    assert_eq!(lists.lindex("lst:names", i).await.unwrap().as_deref(), Some(*want));
    assert_eq!(lists.durable_index("lst:names", i).await.unwrap().as_deref(), Some(*want));
  }
  for (i, want) in expected.iter().rev().enumerate() {
    let i = -(i as i64) - 1;
    assert_eq!(lists.lindex("lst:names", i).await.unwrap().as_deref(), Some(*want));
    assert_eq!(lists.durable_index("lst:names", i).await.unwrap().as_deref(), Some(*want));
  }
  assert_eq!(lists.durable_index("lst:names", 4).await.unwrap(), None);
}

#[tokio::test]
async fn test_multi_value_lpush_order() {
  let h = harness().await;
  let lists = h.engine.lists();
  lists.lpush("lst:q", &strings(&["a", "b", "c"])).await.unwrap();
  h.engine.settle().await;

  assert_eq!(lists.lindex("lst:q", 0).await.unwrap().as_deref(), Some("c"));
  assert_eq!(lists.durable_index("lst:q", 0).await.unwrap().as_deref(), Some("c"));
  assert_eq!(lists.durable_index("lst:q", -1).await.unwrap().as_deref(), Some("a"));
}

#[tokio::test]
async fn test_lindex_miss_reconciles_cache() {
  let h = harness().await;
  let lists = h.engine.lists();
  lists.lpush("lst:q", &strings(&["a", "b", "c"])).await.unwrap();
  h.engine.settle().await;
  h.evict("lst:q").await;

  assert_eq!(lists.lindex("lst:q", 1).await.unwrap().as_deref(), Some("b"));
  h.engine.settle().await;

  let cached = h
    .cached(CacheCommand::LIndex {
      key: "lst:q".to_string(),
      index: 2,
    })
    .await;
  assert_eq!(cached, CacheReply::bulk("a"));
}

#[tokio::test]
async fn test_lset_on_cold_list_and_out_of_range() {
  let h = harness().await;
  let lists = h.engine.lists();
  lists.lpush("lst:q", &strings(&["a", "b", "c"])).await.unwrap();
  h.engine.settle().await;
  h.evict("lst:q").await;

  lists.lset("lst:q", 1, "x").await.unwrap();
  h.engine.settle().await;
  assert_eq!(lists.lindex("lst:q", 1).await.unwrap().as_deref(), Some("x"));
  assert_eq!(lists.durable_index("lst:q", 1).await.unwrap().as_deref(), Some("x"));

  assert_eq!(
    lists.lset("lst:missing", 0, "x").await,
    Err(SyncError::IndexNotFound)
  );
  assert_eq!(lists.lset("lst:q", 10, "x").await, Err(SyncError::IndexNotFound));
}

#[tokio::test]
async fn test_rpop_restores_cold_list() {
  let h = harness().await;
  let lists = h.engine.lists();
  lists.lpush("lst:q", &strings(&["a", "b"])).await.unwrap();
  h.engine.settle().await;
  h.evict("lst:q").await;

  assert_eq!(lists.rpop("lst:q").await.unwrap().as_deref(), Some("a"));
  h.engine.settle().await;
  assert_eq!(lists.durable_index("lst:q", -1).await.unwrap().as_deref(), Some("b"));
  assert_eq!(lists.durable_index("lst:q", 1).await.unwrap(), None);
}

#[tokio::test]
async fn test_rpop_last_value_drops_table() {
  let h = harness().await;
  let lists = h.engine.lists();
  lists.lpush("lst:q", &strings(&["only"])).await.unwrap();
  h.engine.settle().await;

  assert_eq!(lists.rpop("lst:q").await.unwrap().as_deref(), Some("only"));
  h.engine.settle().await;
  assert!(matches!(
    h.rows("SELECT value FROM \"lst_q\"").await,
    Err(DurableError::MissingTable(_))
  ));
}

async fn leaderboard(h: &Harness) {
  let members: Vec<(f64, String)> = [(10.0, "ann"), (20.0, "bob"), (20.0, "cid"), (35.5, "krull"), (40.0, "zoe")]
    .into_iter()
    .map(|(s, m)| (s, m.to_string()))
    .collect();
  assert_eq!(h.engine.sorted_sets().zadd("zset:board", &members).await.unwrap(), 5);
  h.engine.settle().await;
}

#[tokio::test]
async fn test_zrank_matches_in_both_stores() {
  let h = harness().await;
  leaderboard(&h).await;
  let zsets = h.engine.sorted_sets();

  assert_eq!(zsets.zrank("zset:board", "krull").await.unwrap(), Some(3));
  assert_eq!(zsets.durable_rank("zset:board", "krull").await.unwrap(), Some(3));
  assert_eq!(zsets.durable_rank("zset:board", "cid").await.unwrap(), Some(2));
  assert_eq!(zsets.durable_rank("zset:board", "nobody").await.unwrap(), None);

  h.evict("zset:board").await;
  assert_eq!(zsets.zrank("zset:board", "krull").await.unwrap(), Some(3));
  h.engine.settle().await;
  let cached = h
    .cached(CacheCommand::ZRank {
      key: "zset:board".to_string(),
      member: "zoe".to_string(),
    })
    .await;
  assert_eq!(cached, CacheReply::Integer(4));
}

#[tokio::test]
async fn test_zincrby_accumulates_durably() {
  let h = harness().await;
  leaderboard(&h).await;
  let zsets = h.engine.sorted_sets();
  h.evict("zset:board").await;

  // Cold member: seeded from the durable score first.
  assert_eq!(zsets.zincrby("zset:board", 4.5, "krull").await.unwrap(), "40");
  assert_eq!(zsets.zincrby("zset:board", 1.0, "krull").await.unwrap(), "41");
  h.engine.settle().await;

  let rows = h
    .rows("SELECT score FROM \"zset_board\" WHERE member = 'krull'")
    .await
    .unwrap();
  assert_eq!(rows[0].float(0), Some(41.0));
}

#[tokio::test]
async fn test_zrangebyscore_read_through() {
  let h = harness().await;
  leaderboard(&h).await;
  h.evict("zset:board").await;
  let zsets = h.engine.sorted_sets();

  let range = ScoreRange::new(ScoreBound::Inclusive(20.0), ScoreBound::Exclusive(40.0)).with_scores();
  assert_eq!(
    zsets.zrangebyscore("zset:board", range).await.unwrap(),
    strings(&["bob", "20", "cid", "20", "krull", "35.5"])
  );
  h.engine.settle().await;

  let top = ScoreRange::all().limit(0, 2);
  assert_eq!(
    zsets.zrevrangebyscore("zset:board", top).await.unwrap(),
    strings(&["zoe", "krull"])
  );
}

#[tokio::test]
async fn test_zscore_point_backfill() {
  let h = harness().await;
  h.seed(
    "zset_board",
    StructureKind::SortedSet,
    vec![
      vec![SqlValue::Real(1.5), SqlValue::from("ann")],
      vec![SqlValue::Real(3.0), SqlValue::from("bob")],
    ],
  )
  .await;

  let score = h.engine.sorted_sets().zscore("zset:board", "bob").await.unwrap();
  assert_eq!(score.as_deref(), Some("3"));
  h.engine.settle().await;

  // A cold key is restored whole, not just the member that was asked for.
  let cached = h
    .cached(CacheCommand::ZScore {
      key: "zset:board".to_string(),
      member: "ann".to_string(),
    })
    .await;
  assert_eq!(cached, CacheReply::bulk("1.5"));
}

#[tokio::test]
async fn test_hash_rename_relinks_expiry() {
  let h = harness().await;
  let hashes = h.engine.hashes();
  let keyspace = h.engine.keyspace();
  hashes
    .hmset(
      "hash:users",
      &[
        ("name".to_string(), "ada".to_string()),
        ("lang".to_string(), "rust".to_string()),
      ],
    )
    .await
    .unwrap();
  assert_eq!(keyspace.expire("hash:users", 600).await.unwrap(), 1);
  h.engine.settle().await;

  keyspace.rename("hash:users", "hash:people").await.unwrap();
  h.engine.settle().await;

  let fields = hashes.hgetall("hash:people").await.unwrap();
  assert_eq!(fields.get("name").map(String::as_str), Some("ada"));
  assert_eq!(fields.len(), 2);
  assert!(hashes.hgetall("hash:users").await.unwrap().is_empty());

  let mut durable = h.texts("SELECT field FROM \"hash_people\"").await;
  durable.sort();
  assert_eq!(durable, vec!["lang", "name"]);
  assert!(matches!(
    h.rows("SELECT field FROM \"hash_users\"").await,
    Err(DurableError::MissingTable(_))
  ));
  assert_eq!(h.texts("SELECT key FROM \"expiry\"").await, vec!["hash:people"]);
}

#[tokio::test]
async fn test_string_rename_moves_row_between_buckets() {
  let h = harness().await;
  h.engine.strings().set("users", "1", "ann").await.unwrap();
  h.engine.settle().await;

  h.engine
    .keyspace()
    .rename("str:users:1", "str:admins:9")
    .await
    .unwrap();
  h.engine.settle().await;

  assert_eq!(
    h.texts("SELECT key FROM \"str_admins\" WHERE value = 'ann'").await,
    vec!["9"]
  );
  h.evict("str:admins:9").await;
  assert_eq!(
    h.engine.strings().get("admins", "9").await.unwrap().as_deref(),
    Some("ann")
  );
}

#[tokio::test]
async fn test_rename_rejects_mismatched_keys() {
  let h = harness().await;
  let keyspace = h.engine.keyspace();
  assert!(matches!(
    keyspace.rename("hash:users", "set:users").await,
    Err(SyncError::Validation(_))
  ));
  assert!(matches!(
    keyspace.rename("hash:users", "hash:users:1").await,
    Err(SyncError::Validation(_))
  ));
}

#[tokio::test]
async fn test_hash_point_reads_fall_through() {
  let h = harness().await;
  h.seed(
    "hash_cfg",
    StructureKind::Hash,
    vec![
      vec![SqlValue::from("mode"), SqlValue::from("fast")],
      vec![SqlValue::from("level"), SqlValue::from("3")],
    ],
  )
  .await;
  let hashes = h.engine.hashes();

  assert_eq!(hashes.hexists("hash:cfg", "mode").await.unwrap(), 1);
  assert_eq!(hashes.hexists("hash:cfg", "nope").await.unwrap(), 0);
  h.engine.settle().await;

  let values = hashes
    .hmget("hash:cfg", &strings(&["level", "nope", "mode"]))
    .await
    .unwrap();
  assert_eq!(
    values,
    vec![Some("3".to_string()), None, Some("fast".to_string())]
  );
}

#[tokio::test]
async fn test_hdel_removes_fields_and_table() {
  let h = harness().await;
  let hashes = h.engine.hashes();
  hashes.hset("hash:cfg", "mode", "fast").await.unwrap();
  h.engine.settle().await;

  assert_eq!(hashes.hdel("hash:cfg", &strings(&["mode", "other"])).await.unwrap(), 1);
  h.engine.settle().await;
  assert!(matches!(
    h.rows("SELECT field FROM \"hash_cfg\"").await,
    Err(DurableError::MissingTable(_))
  ));
}

#[tokio::test]
async fn test_set_reads_fall_through() {
  let h = harness().await;
  h.seed(
    "set_langs",
    StructureKind::Set,
    vec![vec![SqlValue::from("rust")], vec![SqlValue::from("go")]],
  )
  .await;
  let sets = h.engine.sets();

  assert_eq!(sets.sismember("set:langs", "rust").await.unwrap(), 1);
  assert_eq!(sets.sismember("set:langs", "cobol").await.unwrap(), 0);
  assert_eq!(sets.scard("set:langs").await.unwrap(), 2);
  h.engine.settle().await;

  let mut members = sets.smembers("set:langs").await.unwrap();
  members.sort();
  assert_eq!(members, vec!["go", "rust"]);
}

#[tokio::test]
async fn test_exists_consults_durable() {
  let h = harness().await;
  h.seed(
    "set_langs",
    StructureKind::Set,
    vec![vec![SqlValue::from("rust")]],
  )
  .await;
  let keyspace = h.engine.keyspace();

  assert_eq!(keyspace.exists("set:langs").await.unwrap(), 1);
  assert_eq!(keyspace.exists("set:other").await.unwrap(), 0);
  h.engine.settle().await;
  assert_eq!(
    h.cached(CacheCommand::Exists {
      key: "set:langs".to_string()
    })
    .await,
    CacheReply::Integer(1)
  );
}

#[tokio::test]
async fn test_validation_errors() {
  let h = harness().await;
  assert!(matches!(
    h.engine.sets().sadd("set:tags", &[]).await,
    Err(SyncError::Validation(_))
  ));
  assert!(matches!(
    h.engine.sets().sadd("hash:tags", &strings(&["a"])).await,
    Err(SyncError::Validation(_))
  ));
  assert!(matches!(
    h.engine.lists().lpush("nope:tags", &strings(&["a"])).await,
    Err(SyncError::Config(_))
  ));
  assert!(matches!(
    h.engine
      .sorted_sets()
      .zadd("zset:b", &[(f64::NAN, "a".to_string())])
      .await,
    Err(SyncError::Validation(_))
  ));
}

#[tokio::test]
async fn test_execute_command_lines() {
  let h = harness().await;
  let run = |cmd: &'static str, args: &[&str]| {
    let args = strings(args);
    let engine = &h.engine;
    async move { engine.execute(cmd, &args).await }
  };

  assert_eq!(run("zadd", &["zset:b", "1", "a", "2", "b"]).await.unwrap(), CacheReply::Integer(2));
  assert_eq!(
    run("ZRANGEBYSCORE", &["zset:b", "-inf", "+inf", "WITHSCORES"]).await.unwrap(),
    CacheReply::strings(strings(&["a", "1", "b", "2"]))
  );
  assert_eq!(run("SET", &["users", "1", "x"]).await.unwrap(), CacheReply::ok());
  assert_eq!(run("GET", &["users", "1"]).await.unwrap(), CacheReply::bulk("x"));
  assert_eq!(run("HSET", &["hash:h", "f1", "v1", "f2", "v2"]).await.unwrap(), CacheReply::Integer(2));
  assert!(matches!(run("LPUSH", &["lst:l"]).await, Err(SyncError::Validation(_))));
  assert!(matches!(run("FLUSHALL", &[]).await, Err(SyncError::Validation(_))));
  h.engine.settle().await;
}

#[tokio::test]
async fn test_incr_compensates_with_decr() {
  let h = harness().await;
  let strs = h.engine.strings();
  assert_eq!(strs.incr("hits", "home").await.unwrap(), 1);
  h.engine.settle().await;

  h.fail_writes();
  assert_eq!(strs.incr("hits", "home").await.unwrap(), 2);
  h.engine.settle().await;

  let cached = h
    .cached(CacheCommand::Get {
      key: "str:hits:home".to_string(),
    })
    .await;
  assert_eq!(cached, CacheReply::bulk("1"));
  assert_eq!(
    h.texts("SELECT value FROM \"str_hits\" WHERE key = 'home'").await,
    vec!["1"]
  );
}

#[tokio::test]
async fn test_hset_compensation_restores_previous_value() {
  let h = harness().await;
  let hashes = h.engine.hashes();
  hashes.hset("hash:cfg", "mode", "fast").await.unwrap();
  h.engine.settle().await;

  h.fail_writes();
  let fields = [
    ("mode".to_string(), "slow".to_string()),
    ("level".to_string(), "3".to_string()),
  ];
  assert_eq!(hashes.hset_fields("hash:cfg", &fields).await.unwrap(), 1);
  h.engine.settle().await;

  let hget = |field: &str| CacheCommand::HGet {
    key: "hash:cfg".to_string(),
    field: field.to_string(),
  };
  assert_eq!(h.cached(hget("mode")).await, CacheReply::bulk("fast"));
  assert!(h.cached(hget("level")).await.is_nil());
  assert_eq!(h.texts("SELECT value FROM \"hash_cfg\"").await, vec!["fast"]);
}

#[tokio::test]
async fn test_lpush_compensation_removes_pushed_values() {
  let h = harness().await;
  let lists = h.engine.lists();
  lists.lpush("lst:q", &strings(&["a"])).await.unwrap();
  h.engine.settle().await;

  h.fail_writes();
  assert_eq!(lists.lpush("lst:q", &strings(&["b", "c"])).await.unwrap(), 3);
  h.engine.settle().await;

  let len = h
    .cached(CacheCommand::LLen {
      key: "lst:q".to_string(),
    })
    .await;
  assert_eq!(len, CacheReply::Integer(1));
  assert_eq!(lists.lindex("lst:q", 0).await.unwrap().as_deref(), Some("a"));
  assert_eq!(h.texts("SELECT value FROM \"lst_q\"").await, vec!["a"]);
}

#[tokio::test]
async fn test_zincrby_compensation_subtracts_delta() {
  let h = harness().await;
  leaderboard(&h).await;

  h.fail_writes();
  let zsets = h.engine.sorted_sets();
  assert_eq!(zsets.zincrby("zset:board", 4.5, "krull").await.unwrap(), "40");
  h.engine.settle().await;

  let cached = h
    .cached(CacheCommand::ZScore {
      key: "zset:board".to_string(),
      member: "krull".to_string(),
    })
    .await;
  assert_eq!(cached, CacheReply::bulk("35.5"));
}

#[tokio::test]
async fn test_failed_table_rename_restores_cache_and_expiry() {
  let h = harness().await;
  let mut failures = h.engine.subscribe_failures();
  let keyspace = h.engine.keyspace();
  h.engine
    .hashes()
    .hset("hash:a", "f", "1")
    .await
    .unwrap();
  assert_eq!(keyspace.expire("hash:a", 600).await.unwrap(), 1);
  h.engine.settle().await;

  h.fail_transactions_containing("ALTER TABLE");
  keyspace.rename("hash:a", "hash:b").await.unwrap();
  h.engine.settle().await;

  let field = h
    .cached(CacheCommand::HGet {
      key: "hash:a".to_string(),
      field: "f".to_string(),
    })
    .await;
  assert_eq!(field, CacheReply::bulk("1"));
  let renamed = h
    .cached(CacheCommand::Exists {
      key: "hash:b".to_string(),
    })
    .await;
  assert_eq!(renamed, CacheReply::Integer(0));
  let ttl = h
    .cached(CacheCommand::Ttl {
      key: "hash:a".to_string(),
    })
    .await;
  assert!(matches!(ttl, CacheReply::Integer(secs) if secs > 0));

  assert_eq!(h.texts("SELECT field FROM \"hash_a\"").await, vec!["f"]);
  assert_eq!(h.texts("SELECT key FROM \"expiry\"").await, vec!["hash:a"]);

  let failure = failures.try_recv().unwrap();
  assert_eq!(failure.store, FailedStore::Durable);
  assert_eq!(failure.key, "hash:a");
}

#[tokio::test]
async fn test_failed_expiry_relink_unwinds_string_rename() {
  let h = harness().await;
  let keyspace = h.engine.keyspace();
  h.engine.strings().set("users", "1", "ann").await.unwrap();
  assert_eq!(keyspace.expire("str:users:1", 600).await.unwrap(), 1);
  h.engine.settle().await;

  // The row move and rekey go through; the expiry relink does not.
  h.fail_transactions_containing("\"expiry\"");
  keyspace.rename("str:users:1", "str:admins:9").await.unwrap();
  h.engine.settle().await;

  assert_eq!(
    h.texts("SELECT value FROM \"str_users\" WHERE key = '1'").await,
    vec!["ann"]
  );
  assert!(h.texts("SELECT key FROM \"str_admins\"").await.is_empty());
  assert_eq!(h.texts("SELECT key FROM \"expiry\"").await, vec!["str:users:1"]);

  let restored = h
    .cached(CacheCommand::Get {
      key: "str:users:1".to_string(),
    })
    .await;
  assert_eq!(restored, CacheReply::bulk("ann"));
  let renamed = h
    .cached(CacheCommand::Exists {
      key: "str:admins:9".to_string(),
    })
    .await;
  assert_eq!(renamed, CacheReply::Integer(0));
}

#[tokio::test]
async fn test_lindex_reconciles_mismatch_inside_cached_list() {
  let h = harness().await;
  let lists = h.engine.lists();
  lists.lpush("lst:q", &strings(&["c", "b", "a"])).await.unwrap();
  h.engine.settle().await;

  // Cache drifts to [a, c] while the durable list stays [a, b, c].
  h.cached(CacheCommand::LRem {
    key: "lst:q".to_string(),
    count: 1,
    value: "b".to_string(),
  })
  .await;

  assert_eq!(lists.lindex("lst:q", 2).await.unwrap().as_deref(), Some("c"));
  h.engine.settle().await;

  let at = |index: i64| CacheCommand::LIndex {
    key: "lst:q".to_string(),
    index,
  };
  assert_eq!(h.cached(at(0)).await, CacheReply::bulk("a"));
  assert_eq!(h.cached(at(1)).await, CacheReply::bulk("b"));
  assert_eq!(h.cached(at(2)).await, CacheReply::bulk("c"));
  assert!(h.cached(at(3)).await.is_nil());

  assert_eq!(lists.durable_index("lst:q", -2).await.unwrap().as_deref(), Some("b"));
  assert_eq!(lists.durable_index("lst:q", -3).await.unwrap().as_deref(), Some("a"));
  assert_eq!(lists.durable_index("lst:q", -4).await.unwrap(), None);
}

#[tokio::test]
async fn test_keys_that_would_share_a_table_are_rejected() {
  let h = harness().await;
  let hashes = h.engine.hashes();
  hashes.hset("hash:a:b", "g", "2").await.unwrap();

  assert!(matches!(
    hashes.hset("hash:a_b", "f", "1").await,
    Err(SyncError::Validation(_))
  ));
  assert!(matches!(
    h.engine.keyspace().del(&strings(&["hash:a_b"])).await,
    Err(SyncError::Validation(_))
  ));
  h.engine.settle().await;

  h.evict("hash:a:b").await;
  let fields = hashes.hgetall("hash:a:b").await.unwrap();
  assert_eq!(fields.len(), 1);
  assert_eq!(fields.get("g").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn test_expire_rejects_unrepresentable_ttl() {
  let h = harness().await;
  h.engine.hashes().hset("hash:users", "name", "ada").await.unwrap();

  let reply = h
    .engine
    .execute("EXPIRE", &strings(&["hash:users", "9223372036854775807"]))
    .await;
  assert!(matches!(reply, Err(SyncError::Validation(_))));
  h.engine.settle().await;

  let ttl = h
    .cached(CacheCommand::Ttl {
      key: "hash:users".to_string(),
    })
    .await;
  assert_eq!(ttl, CacheReply::Integer(-1));
  assert!(matches!(
    h.rows("SELECT key FROM \"expiry\"").await,
    Err(DurableError::MissingTable(_))
  ));
}
