use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::cache::{Command, KeyRouter, Store};
use crate::db::{RelationalBackend, SqlParam};
use crate::error::EngineError;

/// External pub/sub transport. The engine only proxies publishes; the
/// transport itself lives with the caller.
#[async_trait]
pub trait Publisher: Send + Sync {
  async fn publish(&self, channel: &str, data: &Value) -> Result<(), EngineError>;
}

/// Delay class of a queued event. The class selects the queue a worker
/// drains, trading latency for batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayClass {
  #[default]
  Immediate,
  Delay3,
  Delay4,
  Delay5,
}

impl DelayClass {
  fn queue_key(self) -> &'static str {
    match self {
      DelayClass::Immediate => "evnt",
      DelayClass::Delay3 => "evnt3",
      DelayClass::Delay4 => "evnt4",
      DelayClass::Delay5 => "evnt5",
    }
  }

  fn max_delay(self) -> Option<i64> {
    match self {
      DelayClass::Immediate => None,
      DelayClass::Delay3 => Some(3),
      DelayClass::Delay4 => Some(4),
      DelayClass::Delay5 => Some(5),
    }
  }
}

/// Appends `[event, payload]` envelopes onto the platform event queues.
pub struct EventProducer {
  store: Arc<dyn Store>,
  router: KeyRouter,
}

impl EventProducer {
  pub fn new(store: Arc<dyn Store>, router: KeyRouter) -> Self {
    Self { store, router }
  }

  fn envelope(event: &str, payload: &Value) -> Result<String, EngineError> {
    serde_json::to_string(&json!([event, payload]))
      .map_err(|e| EngineError::Codec(e.to_string()))
  }

  pub async fn enqueue(
    &self,
    event: &str,
    payload: &Value,
    class: DelayClass,
  ) -> Result<(), EngineError> {
    let key = self.router.route(class.queue_key());
    self
      .store
      .dispatch(Command::new("lpush", key).arg(Self::envelope(event, payload)?))
      .await?;
    Ok(())
  }

  /// One LPUSH carrying every envelope.
  pub async fn enqueue_many(
    &self,
    envelopes: &[(String, Value)],
    class: DelayClass,
  ) -> Result<(), EngineError> {
    if envelopes.is_empty() {
      return Ok(());
    }
    let key = self.router.route(class.queue_key());
    let mut cmd = Command::new("lpush", key);
    for (event, payload) in envelopes {
      cmd = cmd.arg(Self::envelope(event, payload)?);
    }
    self.store.dispatch(cmd).await?;
    Ok(())
  }

  /// Enqueue and additionally record the envelope in the relational audit
  /// table.
  pub async fn persist(
    &self,
    backend: &Arc<dyn RelationalBackend>,
    event: &str,
    payload: &Value,
    is_multi: bool,
    class: DelayClass,
  ) -> Result<(), EngineError> {
    self.enqueue(event, payload, class).await?;
    let sql = "INSERT INTO event_log (event, data, date_added, is_multi, max_delay, is_json) \
               VALUES ($1, $2, NOW(), $3, $4, 1)";
    let params = [
      SqlParam::from(event),
      SqlParam::Json(payload.clone()),
      SqlParam::Bool(is_multi),
      class.max_delay().map(SqlParam::Int).unwrap_or(SqlParam::Null),
    ];
    backend.execute(sql, &params).await?;
    Ok(())
  }
}
