//! Bulk conversion tests - paged export, collection conversion, drains

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use querycache::bulk::{BulkOps, ConvertOptions, ExportOptions, TargetKind};
use querycache::cache::{Command, KeyRouter, MemoryStore, Store};
use querycache::db::{RelationalBackend, RelationalTx, SqlParam};
use querycache::error::EngineError;

/// Serves a fixed number of synthetic rows, honoring the LIMIT/OFFSET
/// suffix the exporter appends.
struct PagedBackend {
  total: usize,
  statements: Mutex<Vec<String>>,
}

impl PagedBackend {
  fn new(total: usize) -> Arc<Self> {
    Arc::new(Self {
      total,
      statements: Mutex::new(Vec::new()),
    })
  }

  fn query_count(&self) -> usize {
    self.statements.lock().len()
  }
}

fn tail_number(sql: &str, marker: &str) -> usize {
  sql
    .split(marker)
    .nth(1)
    .and_then(|rest| rest.split_whitespace().next())
    .and_then(|n| n.parse().ok())
    .unwrap_or(0)
}

#[async_trait]
impl RelationalBackend for PagedBackend {
  async fn query(&self, sql: &str, _params: &[SqlParam]) -> Result<Vec<Value>, EngineError> {
    self.statements.lock().push(sql.to_string());
    let limit = tail_number(sql, "LIMIT ");
    let offset = tail_number(sql, "OFFSET ");
    let end = (offset + limit).min(self.total);
    Ok(
      (offset..end)
        .map(|i| json!({"content": format!("m{}", i), "score": i}))
        .collect(),
    )
  }

  async fn execute(&self, _sql: &str, _params: &[SqlParam]) -> Result<u64, EngineError> {
    Ok(0)
  }

  async fn begin(&self) -> Result<Box<dyn RelationalTx>, EngineError> {
    Err(EngineError::Transaction {
      step: 0,
      message: "not supported by stub".into(),
    })
  }
}

fn bulk(total: usize) -> (BulkOps, Arc<dyn Store>, Arc<PagedBackend>) {
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  let backend = PagedBackend::new(total);
  let ops = BulkOps::new(
    Arc::clone(&store),
    KeyRouter::default(),
    Arc::clone(&backend) as Arc<dyn RelationalBackend>,
  );
  (ops, store, backend)
}

// =============================================================================
// Relational export
// =============================================================================

#[tokio::test]
async fn test_export_pages_exactly_and_fills_sorted_set() {
  let (ops, store, backend) = bulk(2500);
  let exported = ops
    .export_to_sorted_set(
      "SELECT content, score FROM ranks",
      &[],
      "ranks",
      ExportOptions::default(),
    )
    .await
    .unwrap();
  assert_eq!(exported, 2500);
  assert_eq!(backend.query_count(), 3, "2500 rows at page 1000 is 3 pages");

  let card = store.dispatch(Command::new("zcard", "ranks")).await.unwrap();
  assert_eq!(card.as_int(), Some(2500));
}

#[tokio::test]
async fn test_export_empty_query_is_noop() {
  let (ops, store, backend) = bulk(0);
  let exported = ops
    .export_to_sorted_set("SELECT 1", &[], "ranks", ExportOptions::default())
    .await
    .unwrap();
  assert_eq!(exported, 0);
  assert_eq!(backend.query_count(), 1);
  let card = store.dispatch(Command::new("zcard", "ranks")).await.unwrap();
  assert_eq!(card.as_int(), Some(0));
}

// =============================================================================
// Collection conversion
// =============================================================================

async fn seed_zset(store: &Arc<dyn Store>, key: &str, n: usize) {
  for i in 0..n {
    store
      .dispatch(Command::new("zadd", key).arg(i as f64).arg(format!("m{}", i)))
      .await
      .unwrap();
  }
}

#[tokio::test]
async fn test_convert_sorted_set_to_set() {
  let (ops, store, _) = bulk(0);
  seed_zset(&store, "src", 10).await;
  let moved = ops
    .convert_collection(
      "src",
      "dst",
      TargetKind::Set,
      ConvertOptions {
        page_size: 3,
        with_scores: false,
      },
    )
    .await
    .unwrap();
  assert_eq!(moved, 10);
  let card = store.dispatch(Command::new("scard", "dst")).await.unwrap();
  assert_eq!(card.as_int(), Some(10));
}

#[tokio::test]
async fn test_convert_with_scores_carries_pairs() {
  let (ops, store, _) = bulk(0);
  seed_zset(&store, "src", 3).await;
  ops
    .convert_collection(
      "src",
      "dst",
      TargetKind::List,
      ConvertOptions {
        page_size: 100,
        with_scores: true,
      },
    )
    .await
    .unwrap();
  let items = store
    .dispatch(Command::new("lrange", "dst").arg(0i64).arg(-1i64))
    .await
    .unwrap()
    .into_array();
  let texts: Vec<&str> = items.iter().filter_map(|r| r.as_text()).collect();
  assert!(texts.contains(&"m0,0"));
  assert!(texts.contains(&"m2,2"));
}

// =============================================================================
// Deletion helpers
// =============================================================================

#[tokio::test]
async fn test_delete_matching_paths_and_patterns() {
  let (ops, store, _) = bulk(0);
  store.dispatch(Command::new("set", "plain").arg("x")).await.unwrap();
  store
    .dispatch(Command::new("hset", "h").arg("f").arg("x"))
    .await
    .unwrap();
  for i in 0..5 {
    store
      .dispatch(Command::new("set", format!("tmp:{}", i)).arg("x"))
      .await
      .unwrap();
  }

  ops
    .delete_matching(&["plain", "h.f", "tmp:*"])
    .await
    .unwrap();

  assert!(store.dispatch(Command::new("get", "plain")).await.unwrap().is_nil());
  assert!(store
    .dispatch(Command::new("hget", "h").arg("f"))
    .await
    .unwrap()
    .is_nil());
  for i in 0..5 {
    let gone = store
      .dispatch(Command::new("exists", format!("tmp:{}", i)))
      .await
      .unwrap();
    assert_eq!(gone.as_int(), Some(0));
  }
}

#[tokio::test]
async fn test_drain_key_set_deletes_named_keys() {
  let (ops, store, _) = bulk(0);
  for i in 0..4 {
    store
      .dispatch(Command::new("set", format!("sess:{}", i)).arg("x"))
      .await
      .unwrap();
    store
      .dispatch(Command::new("sadd", "expired").arg(i.to_string()))
      .await
      .unwrap();
  }

  let deleted = ops
    .drain_key_set("expired", false, Some("sess:*"))
    .await
    .unwrap();
  assert_eq!(deleted, 4);
  for i in 0..4 {
    let gone = store
      .dispatch(Command::new("exists", format!("sess:{}", i)))
      .await
      .unwrap();
    assert_eq!(gone.as_int(), Some(0));
  }
  let card = store.dispatch(Command::new("scard", "expired")).await.unwrap();
  assert_eq!(card.as_int(), Some(0));
}

#[tokio::test]
async fn test_drain_sorted_key_set_skips_scores() {
  let (ops, store, _) = bulk(0);
  for i in 0..3 {
    store
      .dispatch(Command::new("set", format!("k{}", i)).arg("x"))
      .await
      .unwrap();
    store
      .dispatch(
        Command::new("zadd", "queue")
          .arg(i as f64)
          .arg(format!("k{}", i)),
      )
      .await
      .unwrap();
  }
  let deleted = ops.drain_key_set("queue", true, None).await.unwrap();
  assert_eq!(deleted, 3);
  for i in 0..3 {
    let gone = store
      .dispatch(Command::new("exists", format!("k{}", i)))
      .await
      .unwrap();
    assert_eq!(gone.as_int(), Some(0));
  }
}

#[tokio::test]
async fn test_sorted_set_membership_filter() {
  let (ops, store, _) = bulk(0);
  seed_zset(&store, "z", 3).await;
  let present = ops
    .sorted_set_members_present("z", &["m0", "nope", "m2"])
    .await
    .unwrap();
  assert_eq!(present, vec!["m0".to_string(), "m2".to_string()]);
}
