//! Distributed lock tests - mutual exclusion, retry limits, extension

use std::sync::Arc;
use std::time::Duration;

use querycache::cache::{Command, KeyRouter, MemoryStore, Store};
use querycache::config::LockSection;
use querycache::error::EngineError;
use querycache::lock::LockManager;

fn fast_settings() -> LockSection {
  LockSection {
    retry_count: 3,
    retry_delay_ms: 10,
    retry_jitter_ms: 5,
    drift_factor: 0.01,
    extend_threshold_ms: 50,
  }
}

fn manager(store: Arc<dyn Store>) -> Arc<LockManager> {
  Arc::new(LockManager::single(
    store,
    KeyRouter::default(),
    fast_settings(),
  ))
}

// =============================================================================
// Mutual exclusion
// =============================================================================

#[tokio::test]
async fn test_second_acquire_fails_while_held() {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  let locks = manager(store);

  let held = locks
    .acquire(&["job:42"], Duration::from_secs(10), None)
    .await
    .unwrap();
  let err = locks
    .acquire(&["job:42"], Duration::from_secs(10), None)
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::LockAcquisition { attempts: 3, .. }));
  held.release().await;
}

#[tokio::test]
async fn test_acquire_succeeds_after_release() {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  let locks = manager(store);

  let held = locks
    .acquire(&["job:42"], Duration::from_secs(10), None)
    .await
    .unwrap();
  held.release().await;
  let again = locks.acquire(&["job:42"], Duration::from_secs(10), None).await;
  assert!(again.is_ok());
}

#[tokio::test]
async fn test_acquire_succeeds_after_lease_expiry() {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  let locks = manager(store);

  // Short lease below the extension threshold, so no extender runs.
  let held = locks
    .acquire(&["job:7"], Duration::from_millis(40), None)
    .await
    .unwrap();
  drop(held);
  tokio::time::sleep(Duration::from_millis(60)).await;
  let again = locks.acquire(&["job:7"], Duration::from_secs(1), None).await;
  assert!(again.is_ok());
}

#[tokio::test]
async fn test_multi_resource_set_locks_every_key() {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  let locks = manager(Arc::clone(&store));

  let held = locks
    .acquire(&["a", "b"], Duration::from_secs(10), None)
    .await
    .unwrap();
  for key in ["a_lock", "b_lock"] {
    let exists = store.dispatch(Command::new("exists", key)).await.unwrap();
    assert_eq!(exists.as_int(), Some(1));
  }
  // A set overlapping on one key cannot be acquired.
  let err = locks.acquire(&["b", "c"], Duration::from_secs(10), None).await;
  assert!(err.is_err());
  held.release().await;
  for key in ["a_lock", "b_lock"] {
    let exists = store.dispatch(Command::new("exists", key)).await.unwrap();
    assert_eq!(exists.as_int(), Some(0));
  }
}

#[tokio::test]
async fn test_per_call_retry_limit_overrides_config() {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  let locks = manager(store);

  let held = locks
    .acquire(&["job:42"], Duration::from_secs(10), None)
    .await
    .unwrap();
  let err = locks
    .acquire(&["job:42"], Duration::from_secs(10), Some(1))
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::LockAcquisition { attempts: 1, .. }));
  held.release().await;
}

// =============================================================================
// Key routing
// =============================================================================

#[tokio::test]
async fn test_lock_keys_are_routed_with_suffix() {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  let locks = Arc::new(LockManager::single(
    Arc::clone(&store),
    KeyRouter::new("env1:"),
    fast_settings(),
  ));
  let held = locks
    .acquire(&["{grp7}job"], Duration::from_secs(5), None)
    .await
    .unwrap();
  let exists = store
    .dispatch(Command::new("exists", "{env1:grp7}job_lock"))
    .await
    .unwrap();
  assert_eq!(exists.as_int(), Some(1));
  held.release().await;
}

// =============================================================================
// Lease extension
// =============================================================================

#[tokio::test]
async fn test_lease_extended_while_held() {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  let locks = manager(Arc::clone(&store));

  // 120ms lease with a 50ms extension lead: without extension the key
  // would lapse well before 300ms.
  let held = locks
    .acquire(&["job:ext"], Duration::from_millis(120), None)
    .await
    .unwrap();
  tokio::time::sleep(Duration::from_millis(300)).await;
  let exists = store
    .dispatch(Command::new("exists", "job:ext_lock"))
    .await
    .unwrap();
  assert_eq!(exists.as_int(), Some(1), "lease should have been extended");
  held.release().await;

  let exists = store
    .dispatch(Command::new("exists", "job:ext_lock"))
    .await
    .unwrap();
  assert_eq!(exists.as_int(), Some(0));
}
