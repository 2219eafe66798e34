//! Failure reporting
//!
//! Durable-side problems never reach the caller. They are logged and
//! published here for anyone who subscribed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Which store a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailedStore {
  Durable,
  Cache,
}

impl std::fmt::Display for FailedStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FailedStore::Durable => write!(f, "durable"),
      FailedStore::Cache => write!(f, "cache"),
    }
  }
}

/// A failure observed while mirroring, backfilling or compensating
#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
  pub store: FailedStore,
  pub message: String,
  /// Logical (cache) key the operation was about
  pub key: String,
  pub occurred_at: DateTime<Utc>,
}

#[derive(Clone)]
pub(crate) struct FailureSink {
  tx: broadcast::Sender<SyncFailure>,
}

impl FailureSink {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncFailure> {
    self.tx.subscribe()
  }

  pub fn durable(&self, key: &str, err: impl std::fmt::Display) {
    self.publish(FailedStore::Durable, key, err.to_string());
  }

  pub fn cache(&self, key: &str, err: impl std::fmt::Display) {
    self.publish(FailedStore::Cache, key, err.to_string());
  }

  fn publish(&self, store: FailedStore, key: &str, message: String) {
    tracing::warn!(store = %store, key = %key, "sync failure: {}", message);
    // No subscribers is fine
    let _ = self.tx.send(SyncFailure {
      store,
      message,
      key: key.to_string(),
      occurred_at: Utc::now(),
    });
  }
}
