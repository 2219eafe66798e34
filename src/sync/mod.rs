//! Cache ↔ relational synchronization engine
//!
//! Every mutation runs against the cache first and returns its result; the
//! matching durable write is spawned afterwards. A durable failure publishes a
//! [`SyncFailure`] and runs one compensating cache command block. Reads that
//! miss the cache fall through to the shadow tables and backfill the cache.

mod dispatch;
mod events;
mod hashes;
mod keyspace;
mod lists;
mod ordered;
mod populate;
mod schema;
mod sets;
mod sorted_sets;
mod strings;
mod tasks;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;

use crate::cache::{CacheCommand, CacheMode, CacheReply, CacheStore, InMemoryCacheStore};
use crate::config::{BackendType, PrefixConfig, SyncConfig};
use crate::db::{DurableStore, Row, SqlBuilder, Statement};
use crate::error::{ConfigError, DurableError, SyncResult};
use crate::keys::{KeyMapper, MappedKey};

pub use events::{FailedStore, SyncFailure};
pub use hashes::HashCommands;
pub use keyspace::KeyspaceCommands;
pub use lists::ListCommands;
pub use sets::SetCommands;
pub use sorted_sets::SortedSetCommands;
pub use strings::StringCommands;

use events::FailureSink;
use ordered::SequenceClock;
use schema::SchemaProvisioner;
use tasks::BackgroundTasks;

/// Default failure channel capacity for engines built without a config
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Shared state handed to every command family
#[derive(Clone)]
pub(crate) struct SyncContext {
  pub keys: Arc<KeyMapper>,
  pub cache: Arc<dyn CacheStore>,
  pub reader: Arc<dyn DurableStore>,
  pub writer: Arc<dyn DurableStore>,
  pub sql: SqlBuilder,
  pub schema: SchemaProvisioner,
  pub failures: FailureSink,
  pub tasks: BackgroundTasks,
  pub clock: Arc<SequenceClock>,
}

impl SyncContext {
  pub async fn cache(&self, cmd: CacheCommand) -> SyncResult<CacheReply> {
    Ok(self.cache.execute(cmd).await?)
  }

  pub async fn cache_atomic(&self, cmds: Vec<CacheCommand>) -> SyncResult<Vec<CacheReply>> {
    Ok(self.cache.execute_atomic(cmds).await?)
  }

  pub async fn cache_exists(&self, cache_key: &str) -> SyncResult<bool> {
    let reply = self
      .cache(CacheCommand::Exists {
        key: cache_key.to_string(),
      })
      .await?;
    Ok(reply.into_integer()? > 0)
  }

  /// Read-through query on the reader handle. A missing table is no data;
  /// any other failure is reported and also treated as no data.
  pub async fn read<F>(&self, key: &MappedKey, build: F) -> Vec<Row>
  where
    F: FnOnce(&SqlBuilder) -> Result<Statement, DurableError>,
  {
    let result = match build(&self.sql) {
      Ok(stmt) => self.reader.query(stmt).await,
      Err(e) => Err(e),
    };
    match result {
      Ok(rows) => rows,
      Err(DurableError::MissingTable(_)) => {
        tracing::debug!("No shadow table for {}", key.cache_key);
        Vec::new()
      }
      Err(e) => {
        self.failures.durable(&key.cache_key, e);
        Vec::new()
      }
    }
  }

  /// Spawn the durable half of an upserting mutation: provision the table,
  /// run `build`'s statements in one transaction, compensate with `undo`
  /// on failure.
  pub fn mirror<F>(&self, key: MappedKey, undo: Vec<CacheCommand>, build: F)
  where
    F: FnOnce(&SqlBuilder) -> Result<Vec<Statement>, DurableError> + Send + 'static,
  {
    let ctx = self.clone();
    self.tasks.spawn(async move {
      let result: Result<(), DurableError> = async {
        ctx.schema.ensure_table(&key.table, key.kind).await?;
        let stmts = build(&ctx.sql)?;
        ctx.writer.transaction(stmts).await
      }
      .await;
      if let Err(err) = result {
        ctx.failures.durable(&key.cache_key, err);
        ctx.compensate(&key.cache_key, undo).await;
      }
    });
  }

  /// Spawn the durable half of a removing mutation. Nothing to remove from a
  /// missing table; once the cache structure is gone the table is dropped
  /// if empty.
  pub fn mirror_removal<F>(&self, key: MappedKey, undo: Vec<CacheCommand>, build: F)
  where
    F: FnOnce(&SqlBuilder) -> Result<Vec<Statement>, DurableError> + Send + 'static,
  {
    let ctx = self.clone();
    self.tasks.spawn(async move {
      let result = match build(&ctx.sql) {
        Ok(stmts) => ctx.writer.transaction(stmts).await,
        Err(e) => Err(e),
      };
      match result {
        Ok(()) | Err(DurableError::MissingTable(_)) => ctx.prune_if_gone(&key).await,
        Err(err) => {
          ctx.failures.durable(&key.cache_key, err);
          ctx.compensate(&key.cache_key, undo).await;
        }
      }
    });
  }

  /// One attempt at undoing a cache mutation; failures are only reported.
  pub async fn compensate(&self, cache_key: &str, undo: Vec<CacheCommand>) {
    if undo.is_empty() {
      return;
    }
    tracing::debug!("Compensating {} with {} cache commands", cache_key, undo.len());
    if let Err(err) = self.cache.execute_atomic(undo).await {
      self.failures.cache(cache_key, err);
    }
  }

  async fn prune_if_gone(&self, key: &MappedKey) {
    match self.cache_exists(&key.cache_key).await {
      Ok(true) => {}
      Ok(false) => {
        if let Err(err) = self.schema.drop_table_if_empty(&key.table).await {
          self.failures.durable(&key.cache_key, err);
        }
      }
      Err(err) => self.failures.cache(&key.cache_key, err),
    }
  }
}

/// The synchronization engine
///
/// Cheap to share behind an `Arc`; all command families borrow the same
/// context.
pub struct SyncEngine {
  ctx: SyncContext,
}

impl SyncEngine {
  /// Engine over one durable handle used for both reads and writes.
  pub fn new(
    prefixes: &PrefixConfig,
    cache: Arc<dyn CacheStore>,
    durable: Arc<dyn DurableStore>,
  ) -> Result<Self, ConfigError> {
    Self::with_stores(
      prefixes,
      cache,
      durable.clone(),
      durable,
      DEFAULT_EVENT_CAPACITY,
    )
  }

  pub fn with_stores(
    prefixes: &PrefixConfig,
    cache: Arc<dyn CacheStore>,
    reader: Arc<dyn DurableStore>,
    writer: Arc<dyn DurableStore>,
    event_capacity: usize,
  ) -> Result<Self, ConfigError> {
    let keys = Arc::new(KeyMapper::new(prefixes)?);
    let sql = SqlBuilder::new(writer.dialect());
    Ok(Self {
      ctx: SyncContext {
        keys,
        cache,
        reader,
        schema: SchemaProvisioner::new(writer.clone()),
        writer,
        sql,
        failures: FailureSink::new(event_capacity),
        tasks: BackgroundTasks::new(),
        clock: Arc::new(SequenceClock::new()),
      },
    })
  }

  /// Build cache and durable backends from configuration.
  pub async fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
    config.validate()?;

    let cache: Arc<dyn CacheStore> = match config.cache.mode {
      CacheMode::Builtin => {
        let store = Arc::new(InMemoryCacheStore::new(
          config.cache.max_memory_bytes(),
          config.cache.eviction,
          config.cache.default_ttl(),
        ));
        if config.cache.sweep_interval > 0 {
          store.spawn_expiry_sweep(Duration::from_secs(config.cache.sweep_interval));
        }
        tracing::info!(
          "Using builtin cache (max memory {}, eviction {})",
          crate::cache::config::format_memory_size(config.cache.max_memory_bytes()),
          config.cache.eviction
        );
        store
      }
      #[cfg(feature = "redis-proxy")]
      CacheMode::Proxy => {
        let client = crate::cache::RedisProxyClient::new(&config.cache.proxy)
          .await
          .context("connecting to Redis")?;
        client.test_connection().await.context("pinging Redis")?;
        tracing::info!(
          "Proxying cache to {}:{}",
          config.cache.proxy.host,
          config.cache.proxy.port
        );
        Arc::new(client)
      }
      #[cfg(not(feature = "redis-proxy"))]
      CacheMode::Proxy => anyhow::bail!("cache proxy mode requires the 'redis-proxy' feature"),
    };

    let (reader, writer) = Self::durable_from_config(config).await?;
    Ok(Self::with_stores(
      &config.prefixes,
      cache,
      reader,
      writer,
      config.events.capacity,
    )?)
  }

  async fn durable_from_config(
    config: &SyncConfig,
  ) -> anyhow::Result<(Arc<dyn DurableStore>, Arc<dyn DurableStore>)> {
    match config.durable.backend {
      #[cfg(feature = "sqlite")]
      BackendType::Sqlite => {
        let path = config.durable.sqlite.path.as_str();
        tracing::info!("Using SQLite durable store at {}", path);
        let writer: Arc<dyn DurableStore> = Arc::new(
          crate::db::SqliteBackend::new(path)
            .await
            .context("opening SQLite writer")?,
        );
        // Separate in-memory connections would be separate databases.
        if path == ":memory:" {
          return Ok((writer.clone(), writer));
        }
        let reader: Arc<dyn DurableStore> = Arc::new(
          crate::db::SqliteBackend::new(path)
            .await
            .context("opening SQLite reader")?,
        );
        Ok((reader, writer))
      }
      #[cfg(feature = "postgres")]
      BackendType::Postgres => {
        let pg = &config.durable.postgres;
        tracing::info!("Using PostgreSQL durable store");
        let writer: Arc<dyn DurableStore> = Arc::new(
          crate::db::PostgresBackend::new(&pg.url, pg.max_connections)
            .context("creating PostgreSQL writer pool")?,
        );
        let reader: Arc<dyn DurableStore> = Arc::new(
          crate::db::PostgresBackend::new(&pg.url, pg.max_connections)
            .context("creating PostgreSQL reader pool")?,
        );
        Ok((reader, writer))
      }
      #[allow(unreachable_patterns)]
      other => anyhow::bail!("durable backend {:?} is not compiled in", other),
    }
  }

  pub fn keys(&self) -> &KeyMapper {
    &self.ctx.keys
  }

  pub fn strings(&self) -> StringCommands<'_> {
    StringCommands::new(&self.ctx)
  }

  pub fn lists(&self) -> ListCommands<'_> {
    ListCommands::new(&self.ctx)
  }

  pub fn sets(&self) -> SetCommands<'_> {
    SetCommands::new(&self.ctx)
  }

  pub fn sorted_sets(&self) -> SortedSetCommands<'_> {
    SortedSetCommands::new(&self.ctx)
  }

  pub fn hashes(&self) -> HashCommands<'_> {
    HashCommands::new(&self.ctx)
  }

  pub fn keyspace(&self) -> KeyspaceCommands<'_> {
    KeyspaceCommands::new(&self.ctx)
  }

  /// Run a Redis-style command line (`ZADD zset:board 1 ann`).
  pub async fn execute(&self, cmd: &str, args: &[String]) -> SyncResult<CacheReply> {
    dispatch::execute(self, cmd, args).await
  }

  pub fn subscribe_failures(&self) -> broadcast::Receiver<SyncFailure> {
    self.ctx.failures.subscribe()
  }

  /// Number of spawned durable tasks still running
  pub fn in_flight(&self) -> usize {
    self.ctx.tasks.in_flight()
  }

  /// Wait until all spawned durable work has finished.
  pub async fn settle(&self) {
    self.ctx.tasks.settle().await
  }
}
