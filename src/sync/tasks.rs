use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// Tracks spawned durable work so callers can wait for it to drain.
#[derive(Clone)]
pub(crate) struct BackgroundTasks {
  inflight: Arc<watch::Sender<usize>>,
}

struct InflightGuard {
  inflight: Arc<watch::Sender<usize>>,
}

impl Drop for InflightGuard {
  fn drop(&mut self) {
    self.inflight.send_modify(|n| *n = n.saturating_sub(1));
  }
}

impl BackgroundTasks {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(0usize);
    Self {
      inflight: Arc::new(tx),
    }
  }

  /// Spawn `fut`; it counts as in flight until it completes or panics.
  pub fn spawn<F>(&self, fut: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.inflight.send_modify(|n| *n += 1);
    let guard = InflightGuard {
      inflight: self.inflight.clone(),
    };
    tokio::spawn(async move {
      let _guard = guard;
      fut.await;
    });
  }

  pub fn in_flight(&self) -> usize {
    *self.inflight.borrow()
  }

  /// Resolve once nothing is in flight. Work spawned by in-flight work is
  /// counted before its parent finishes, so chains are waited for too.
  pub async fn settle(&self) {
    let mut rx = self.inflight.subscribe();
    let _ = rx.wait_for(|n| *n == 0).await;
  }
}
