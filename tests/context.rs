//! Engine context tests - wiring, publish proxy

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use querycache::config::EngineConfig;
use querycache::db::{RelationalBackend, RelationalTx, SqlParam};
use querycache::error::EngineError;
use querycache::events::Publisher;
use querycache::query::CacheOptions;
use querycache::EngineContext;

struct EmptyBackend;

#[async_trait]
impl RelationalBackend for EmptyBackend {
  async fn query(&self, _sql: &str, _params: &[SqlParam]) -> Result<Vec<Value>, EngineError> {
    Ok(vec![json!({"ok": true})])
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

#[derive(Default)]
struct RecordingPublisher {
  published: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
  async fn publish(&self, channel: &str, data: &Value) -> Result<(), EngineError> {
    self.published.lock().push((channel.to_string(), data.clone()));
    Ok(())
  }
}

#[tokio::test]
async fn test_in_memory_context_executes_queries() {
  let ctx = EngineContext::in_memory(EngineConfig::default(), Arc::new(EmptyBackend));
  let out = ctx
    .executor()
    .execute(
      "SELECT 1",
      &[],
      None,
      CacheOptions::keyed("k").wait_for_cache_write(),
    )
    .await
    .unwrap();
  assert_eq!(out, Some(json!([{"ok": true}])));
}

#[tokio::test]
async fn test_default_ttl_flows_from_config() {
  let config = EngineConfig {
    default_ttl_seconds: 120,
    ..Default::default()
  };
  let ctx = EngineContext::in_memory(config, Arc::new(EmptyBackend));
  ctx
    .executor()
    .execute(
      "SELECT 1",
      &[],
      None,
      CacheOptions::keyed("k").wait_for_cache_write(),
    )
    .await
    .unwrap();
  let ttl = ctx
    .store()
    .dispatch(querycache::cache::Command::new("ttl", "k"))
    .await
    .unwrap();
  assert!(ttl.as_int().unwrap() > 100);
}

#[tokio::test]
async fn test_publish_proxies_to_registered_transport() {
  let mut ctx = EngineContext::in_memory(EngineConfig::default(), Arc::new(EmptyBackend));
  assert!(ctx.publish("ch", &json!(1)).await.is_err());

  let publisher = Arc::new(RecordingPublisher::default());
  ctx.set_publisher(Arc::clone(&publisher) as Arc<dyn Publisher>);
  ctx.publish("ch", &json!({"n": 1})).await.unwrap();
  assert_eq!(
    *publisher.published.lock(),
    vec![("ch".to_string(), json!({"n": 1}))]
  );
}
