use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use uuid::Uuid;

use crate::cache::{KeyRouter, Store};
use crate::config::LockSection;
use crate::error::EngineError;

/// Quorum lock over one or more independent stores. A lock is held when a
/// majority of stores accepted every key, with enough validity left after
/// subtracting clock drift.
pub struct LockManager {
  stores: Vec<Arc<dyn Store>>,
  router: KeyRouter,
  settings: LockSection,
}

impl LockManager {
  pub fn new(stores: Vec<Arc<dyn Store>>, router: KeyRouter, settings: LockSection) -> Self {
    Self {
      stores,
      router,
      settings,
    }
  }

  pub fn single(store: Arc<dyn Store>, router: KeyRouter, settings: LockSection) -> Self {
    Self::new(vec![store], router, settings)
  }

  /// Routed lock keys. The suffix goes on after routing so the prefix
  /// lands inside any hash-tag braces.
  fn lock_keys(&self, resources: &[&str]) -> Vec<String> {
    resources
      .iter()
      .map(|r| format!("{}_lock", self.router.route(r)))
      .collect()
  }

  /// Acquire a lease over all named resources, retrying with jittered
  /// delays. `retries` bounds this acquisition; `None` falls back to the
  /// configured count. Every key on a voting store carries the same random
  /// token; release and extension are token-guarded.
  pub async fn acquire(
    &self,
    resources: &[&str],
    ttl: Duration,
    retries: Option<u32>,
  ) -> Result<LockHandle, EngineError> {
    let keys = self.lock_keys(resources);
    let token = Uuid::new_v4().to_string();
    let ttl_ms = ttl.as_millis() as u64;
    let drift = (ttl_ms as f64 * self.settings.drift_factor) as u64 + 2;
    let quorum = quorum_of(self.stores.len());
    let attempts_allowed = retries.unwrap_or(self.settings.retry_count);

    for attempt in 0..attempts_allowed {
      let started = Instant::now();
      let mut votes = 0usize;
      for store in &self.stores {
        if lock_on_store(store, &keys, &token, ttl_ms).await {
          votes += 1;
        }
      }
      let elapsed = started.elapsed().as_millis() as u64;
      let validity = ttl_ms.saturating_sub(elapsed).saturating_sub(drift);

      if votes >= quorum && validity > 0 {
        let released = Arc::new(AtomicBool::new(false));
        let extender = spawn_extender(
          self.stores.clone(),
          keys.clone(),
          token.clone(),
          ttl_ms,
          self.settings.extend_threshold_ms,
          &released,
        );
        return Ok(LockHandle {
          stores: self.stores.clone(),
          keys,
          token,
          released,
          extender,
        });
      }

      // Partial grab; give the keys back before retrying.
      unlock_everywhere(&self.stores, &keys, &token).await;
      if attempt + 1 < attempts_allowed {
        let jitter = rand::thread_rng().gen_range(0..=self.settings.retry_jitter_ms * 2);
        let delay = (self.settings.retry_delay_ms + jitter)
          .saturating_sub(self.settings.retry_jitter_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
      }
    }

    Err(EngineError::LockAcquisition {
      resources: resources.iter().map(|r| r.to_string()).collect(),
      attempts: attempts_allowed,
    })
  }
}

fn quorum_of(nodes: usize) -> usize {
  nodes / 2 + 1
}

async fn lock_on_store(store: &Arc<dyn Store>, keys: &[String], token: &str, ttl_ms: u64) -> bool {
  for key in keys {
    match store.set_nx_px(key, token, ttl_ms).await {
      Ok(true) => {}
      _ => return false,
    }
  }
  true
}

async fn unlock_everywhere(stores: &[Arc<dyn Store>], keys: &[String], token: &str) {
  for store in stores {
    for key in keys {
      if let Err(e) = store.del_if_match(key, token).await {
        tracing::warn!(key, error = %e, "lock release failed");
      }
    }
  }
}

/// Background lease extension. Fires shortly before the lease would lapse
/// and resets the TTL on every key still carrying our token; stops once
/// extension loses quorum or the handle is released.
fn spawn_extender(
  stores: Vec<Arc<dyn Store>>,
  keys: Vec<String>,
  token: String,
  ttl_ms: u64,
  lead_ms: u64,
  released: &Arc<AtomicBool>,
) -> Option<tokio::task::JoinHandle<()>> {
  if ttl_ms <= lead_ms {
    return None;
  }
  let released = Arc::clone(released);
  let quorum = quorum_of(stores.len());
  Some(tokio::spawn(async move {
    loop {
      tokio::time::sleep(Duration::from_millis(ttl_ms - lead_ms)).await;
      if released.load(Ordering::Acquire) {
        return;
      }
      let mut extended = 0usize;
      for store in &stores {
        let mut ok = true;
        for key in &keys {
          match store.pexpire_if_match(key, &token, ttl_ms).await {
            Ok(true) => {}
            _ => ok = false,
          }
        }
        if ok {
          extended += 1;
        }
      }
      if extended < quorum {
        tracing::warn!(keys = ?keys, "lock extension lost quorum, lease will lapse");
        return;
      }
    }
  }))
}

/// A held lease. Call [`release`](LockHandle::release) when done; merely
/// dropping the handle stops the extender and lets the lease lapse on its
/// own TTL.
pub struct LockHandle {
  stores: Vec<Arc<dyn Store>>,
  keys: Vec<String>,
  token: String,
  released: Arc<AtomicBool>,
  extender: Option<tokio::task::JoinHandle<()>>,
}

impl fmt::Debug for LockHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LockHandle")
      .field("keys", &self.keys)
      .field("token", &self.token)
      .finish_non_exhaustive()
  }
}

impl LockHandle {
  pub async fn release(mut self) {
    self.released.store(true, Ordering::Release);
    if let Some(task) = self.extender.take() {
      task.abort();
    }
    unlock_everywhere(&self.stores, &self.keys, &self.token).await;
  }
}

impl Drop for LockHandle {
  fn drop(&mut self) {
    self.released.store(true, Ordering::Release);
    if let Some(task) = self.extender.take() {
      task.abort();
    }
  }
}
