//! Cursor scanner tests - pagination, consumption modes, termination

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use querycache::cache::{Command, Consumer, KeyRouter, MemoryStore, ScanOptions, Scanner, Store};

async fn seeded_store(n: usize) -> Arc<dyn Store> {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  for i in 0..n {
    store
      .dispatch(Command::new("set", format!("item:{:03}", i)).arg("x"))
      .await
      .unwrap();
  }
  store
    .dispatch(Command::new("set", "other:1").arg("x"))
    .await
    .unwrap();
  store
}

// =============================================================================
// Key scans
// =============================================================================

#[tokio::test]
async fn test_collect_visits_each_key_exactly_once() {
  for page in [1, 3, 10, 100] {
    let store = seeded_store(25).await;
    let scanner = Scanner::new(store, KeyRouter::default());
    let outcome = scanner
      .scan_keys(
        "item:*",
        ScanOptions {
          count: Some(page),
          ..Default::default()
        },
        Consumer::Collect,
      )
      .await
      .unwrap();
    assert_eq!(outcome.cursor, 0);
    let unique: HashSet<_> = outcome.items.iter().collect();
    assert_eq!(unique.len(), 25, "page size {}", page);
  }
}

#[tokio::test]
async fn test_page_consumer_sees_every_item() {
  let store = seeded_store(12).await;
  let scanner = Scanner::new(store, KeyRouter::default());

  let seen = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&seen);
  let outcome = scanner
    .scan_keys(
      "item:*",
      ScanOptions {
        count: Some(5),
        ..Default::default()
      },
      Consumer::Pages(Box::new(move |page| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
          sink.lock().extend(page);
          Ok(())
        })
      })),
    )
    .await
    .unwrap();
  assert!(outcome.items.is_empty());
  assert_eq!(seen.lock().len(), 12);
}

#[tokio::test]
async fn test_single_pass_stops_after_one_page() {
  let store = seeded_store(25).await;
  let scanner = Scanner::new(store, KeyRouter::default());
  let outcome = scanner
    .scan_keys(
      "item:*",
      ScanOptions {
        count: Some(10),
        single_pass: true,
        ..Default::default()
      },
      Consumer::Collect,
    )
    .await
    .unwrap();
  assert_eq!(outcome.items.len(), 10);
  assert_ne!(outcome.cursor, 0);
}

#[tokio::test]
async fn test_resume_from_returned_cursor() {
  let store = seeded_store(20).await;
  let scanner = Scanner::new(Arc::clone(&store), KeyRouter::default());
  let first = scanner
    .scan_keys(
      "item:*",
      ScanOptions {
        count: Some(8),
        single_pass: true,
        ..Default::default()
      },
      Consumer::Collect,
    )
    .await
    .unwrap();
  let rest = scanner
    .scan_keys(
      "item:*",
      ScanOptions {
        cursor: first.cursor,
        count: Some(8),
        ..Default::default()
      },
      Consumer::Collect,
    )
    .await
    .unwrap();
  let all: HashSet<_> = first.items.iter().chain(rest.items.iter()).collect();
  assert_eq!(all.len(), 20);
}

#[tokio::test]
async fn test_pattern_routed_through_prefix() {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  store
    .dispatch(Command::new("set", "t:item:1").arg("x"))
    .await
    .unwrap();
  store
    .dispatch(Command::new("set", "item:1").arg("x"))
    .await
    .unwrap();
  let scanner = Scanner::new(store, KeyRouter::new("t:"));
  let outcome = scanner
    .scan_keys("item:*", ScanOptions::default(), Consumer::Collect)
    .await
    .unwrap();
  assert_eq!(outcome.items, vec!["t:item:1".to_string()]);
}

// =============================================================================
// Hash scans
// =============================================================================

#[tokio::test]
async fn test_hash_scan_yields_field_value_pairs() {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  for i in 0..7 {
    store
      .dispatch(
        Command::new("hset", "h")
          .arg(format!("f{}", i))
          .arg(format!("v{}", i)),
      )
      .await
      .unwrap();
  }
  let scanner = Scanner::new(store, KeyRouter::default());
  let outcome = scanner
    .scan_hash(
      "h",
      None,
      ScanOptions {
        count: Some(3),
        ..Default::default()
      },
      Consumer::Collect,
    )
    .await
    .unwrap();
  assert_eq!(outcome.items.len(), 7);
  assert!(outcome.items.contains(&("f3".to_string(), "v3".to_string())));
}

#[tokio::test]
async fn test_empty_keyspace_terminates() {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  let scanner = Scanner::new(store, KeyRouter::default());
  let outcome = scanner
    .scan_keys("nope:*", ScanOptions::default(), Consumer::Collect)
    .await
    .unwrap();
  assert_eq!(outcome.cursor, 0);
  assert!(outcome.items.is_empty());
}
