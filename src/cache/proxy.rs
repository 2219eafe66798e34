//! Redis proxy client for connecting to external Redis servers

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};

use super::command::{format_score, CacheCommand, CacheReply};
use super::config::CacheProxyConfig;
use super::store::CacheStore;
use crate::error::CacheError;

/// Redis proxy client that connects to external Redis servers
pub struct RedisProxyClient {
  connection: ConnectionManager,
}

impl RedisProxyClient {
  /// Create a new Redis proxy client from configuration
  pub async fn new(config: &CacheProxyConfig) -> Result<Self, CacheError> {
    let client = Client::open(config.connection_url()).map_err(map_error)?;
    let connection = ConnectionManager::new(client).await.map_err(map_error)?;
    Ok(Self { connection })
  }

  /// Test the connection to Redis
  pub async fn test_connection(&self) -> Result<(), CacheError> {
    let mut conn = self.connection.clone();
    redis::cmd("PING")
      .query_async::<()>(&mut conn)
      .await
      .map_err(map_error)
  }

  fn to_redis(cmd: &CacheCommand) -> redis::Cmd {
    let mut out = redis::cmd(cmd.name());
    out.arg(cmd.args());
    out
  }

  /// Convert a Redis value into a reply
  fn parse_value(value: redis::Value) -> Result<CacheReply, CacheError> {
    match value {
      redis::Value::Nil => Ok(CacheReply::Nil),
      redis::Value::Int(i) => Ok(CacheReply::Integer(i)),
      redis::Value::BulkString(bytes) => Ok(CacheReply::Bulk(
        String::from_utf8_lossy(&bytes).into_owned(),
      )),
      redis::Value::SimpleString(s) => Ok(CacheReply::Status(s)),
      redis::Value::Okay => Ok(CacheReply::ok()),
      redis::Value::Double(d) => Ok(CacheReply::Bulk(format_score(d))),
      redis::Value::Boolean(b) => Ok(CacheReply::Integer(b as i64)),
      redis::Value::VerbatimString { text, .. } => Ok(CacheReply::Bulk(text)),
      redis::Value::Array(items) | redis::Value::Set(items) => items
        .into_iter()
        .map(Self::parse_value)
        .collect::<Result<Vec<_>, _>>()
        .map(CacheReply::Array),
      redis::Value::Map(pairs) => {
        let mut flat = Vec::with_capacity(pairs.len() * 2);
        for (k, v) in pairs {
          flat.push(Self::parse_value(k)?);
          flat.push(Self::parse_value(v)?);
        }
        Ok(CacheReply::Array(flat))
      }
      other => Err(CacheError::UnexpectedReply(format!("{:?}", other))),
    }
  }
}

/// Sort Redis failures into the cache error taxonomy
fn map_error(err: RedisError) -> CacheError {
  match err.code() {
    Some("WRONGTYPE") => CacheError::WrongType,
    Some("OOM") => CacheError::OutOfMemory,
    Some(_) => CacheError::Command(err.detail().unwrap_or_default().to_string()),
    None if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() => {
      CacheError::Connection(err.to_string())
    }
    None => CacheError::Command(err.to_string()),
  }
}

#[async_trait]
impl CacheStore for RedisProxyClient {
  async fn execute(&self, cmd: CacheCommand) -> Result<CacheReply, CacheError> {
    let mut conn = self.connection.clone();
    let value: redis::Value = Self::to_redis(&cmd)
      .query_async(&mut conn)
      .await
      .map_err(map_error)?;
    Self::parse_value(value)
  }

  async fn execute_atomic(&self, cmds: Vec<CacheCommand>) -> Result<Vec<CacheReply>, CacheError> {
    let mut conn = self.connection.clone();
    let mut pipe = redis::pipe();
    pipe.atomic();
    for cmd in &cmds {
      pipe.add_command(Self::to_redis(cmd));
    }
    let values: Vec<redis::Value> = pipe.query_async(&mut conn).await.map_err(map_error)?;
    values.into_iter().map(Self::parse_value).collect()
  }
}
