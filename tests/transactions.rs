//! Transaction runner tests - chaining, rollback, silent mode

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use querycache::db::{RelationalBackend, RelationalTx, SqlParam};
use querycache::error::EngineError;
use querycache::query::{step, TransactionRunner, TxOptions};

/// Relational stub with transactional visibility: statements stage inside
/// a transaction and only land in `committed` on commit.
#[derive(Default)]
struct TxBackend {
  committed: Arc<Mutex<Vec<String>>>,
  rollbacks: Arc<Mutex<usize>>,
}

struct StubTx {
  staged: Vec<String>,
  committed: Arc<Mutex<Vec<String>>>,
  rollbacks: Arc<Mutex<usize>>,
}

#[async_trait]
impl RelationalBackend for TxBackend {
  async fn query(&self, _sql: &str, _params: &[SqlParam]) -> Result<Vec<Value>, EngineError> {
    Ok(Vec::new())
  }

  async fn execute(&self, sql: &str, _params: &[SqlParam]) -> Result<u64, EngineError> {
    self.committed.lock().push(sql.to_string());
    Ok(1)
  }

  async fn begin(&self) -> Result<Box<dyn RelationalTx>, EngineError> {
    Ok(Box::new(StubTx {
      staged: Vec::new(),
      committed: Arc::clone(&self.committed),
      rollbacks: Arc::clone(&self.rollbacks),
    }))
  }
}

#[async_trait]
impl RelationalTx for StubTx {
  async fn query(&mut self, sql: &str, _params: &[SqlParam]) -> Result<Vec<Value>, EngineError> {
    if sql.contains("boom") {
      return Err(EngineError::relational(sql, "stub failure"));
    }
    self.staged.push(sql.to_string());
    Ok(vec![json!({"echo": sql})])
  }

  async fn execute(&mut self, sql: &str, _params: &[SqlParam]) -> Result<u64, EngineError> {
    if sql.contains("boom") {
      return Err(EngineError::relational(sql, "stub failure"));
    }
    self.staged.push(sql.to_string());
    Ok(1)
  }

  async fn commit(self: Box<Self>) -> Result<(), EngineError> {
    self.committed.lock().extend(self.staged);
    Ok(())
  }

  async fn rollback(self: Box<Self>) -> Result<(), EngineError> {
    *self.rollbacks.lock() += 1;
    Ok(())
  }
}

fn runner() -> (TransactionRunner, Arc<TxBackend>) {
  let backend = Arc::new(TxBackend::default());
  (
    TransactionRunner::new(
      Arc::clone(&backend) as Arc<dyn RelationalBackend>,
      None,
    ),
    backend,
  )
}

// =============================================================================
// Chaining
// =============================================================================

#[tokio::test]
async fn test_chain_commits_and_returns_last_result() {
  let (runner, backend) = runner();
  let steps = vec![
    step(|tx, _prev| {
      Box::pin(async move {
        tx.execute("INSERT INTO a VALUES (1)", &[]).await?;
        Ok(Some(json!(1)))
      })
    }),
    step(|tx, prev| {
      Box::pin(async move {
        let carried = prev.unwrap();
        tx.execute("INSERT INTO b VALUES (2)", &[]).await?;
        Ok(Some(json!({"prev": carried, "done": true})))
      })
    }),
  ];
  let out = runner.run(steps, TxOptions::default()).await.unwrap();
  assert_eq!(out, Some(json!({"prev": 1, "done": true})));
  assert_eq!(
    *backend.committed.lock(),
    vec![
      "INSERT INTO a VALUES (1)".to_string(),
      "INSERT INTO b VALUES (2)".to_string()
    ]
  );
}

#[tokio::test]
async fn test_previous_result_feeds_next_step() {
  let (runner, _backend) = runner();
  let steps = vec![
    step(|tx, _prev| {
      Box::pin(async move {
        let rows = tx.query("SELECT 1", &[]).await?;
        Ok(rows.into_iter().next())
      })
    }),
    step(|_tx, prev| Box::pin(async move { Ok(prev) })),
  ];
  let out = runner.run(steps, TxOptions::default()).await.unwrap();
  assert_eq!(out, Some(json!({"echo": "SELECT 1"})));
}

// =============================================================================
// Rollback
// =============================================================================

#[tokio::test]
async fn test_failing_step_rolls_back_everything() {
  let (runner, backend) = runner();
  let steps = vec![
    step(|tx, _prev| {
      Box::pin(async move {
        tx.execute("INSERT INTO a VALUES (1)", &[]).await?;
        Ok(None)
      })
    }),
    step(|tx, _prev| {
      Box::pin(async move {
        tx.execute("boom", &[]).await?;
        Ok(None)
      })
    }),
  ];
  let err = runner.run(steps, TxOptions::default()).await.unwrap_err();
  assert!(matches!(err, EngineError::Transaction { step: 1, .. }));
  assert!(backend.committed.lock().is_empty(), "no partial effects");
  assert_eq!(*backend.rollbacks.lock(), 1);
}

#[tokio::test]
async fn test_silent_mode_swallows_failure() {
  let (runner, backend) = runner();
  let steps = vec![step(|tx, _prev| {
    Box::pin(async move {
      tx.execute("boom", &[]).await?;
      Ok(None)
    })
  })];
  let out = runner
    .run(
      steps,
      TxOptions {
        silent_on_error: true,
        ..Default::default()
      },
    )
    .await
    .unwrap();
  assert_eq!(out, None);
  assert_eq!(*backend.rollbacks.lock(), 1);
}

#[tokio::test]
async fn test_empty_chain_rejected_even_in_silent_mode() {
  let (runner, _backend) = runner();
  let err = runner
    .run(
      Vec::new(),
      TxOptions {
        silent_on_error: true,
        ..Default::default()
      },
    )
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::Transaction { step: 0, .. }));
}
