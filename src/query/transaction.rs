use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::db::{PoolName, RelationalBackend, RelationalTx};
use crate::error::EngineError;

/// One step of a relational transaction. Receives the open transaction
/// and the previous step's output; its own output feeds the next step.
pub type TxStep = Box<
  dyn for<'t> FnMut(
      &'t mut dyn RelationalTx,
      Option<Value>,
    ) -> BoxFuture<'t, Result<Option<Value>, EngineError>>
    + Send,
>;

#[derive(Default)]
pub struct TxOptions {
  /// Swallow the failure after rollback and return `None`.
  pub silent_on_error: bool,
  pub pool: PoolName,
}

/// Runs a chain of steps inside one relational transaction. Any step
/// failure rolls the whole chain back; the connection returns to its pool
/// on every exit path.
pub struct TransactionRunner {
  primary: Arc<dyn RelationalBackend>,
  archive: Option<Arc<dyn RelationalBackend>>,
}

impl TransactionRunner {
  pub fn new(
    primary: Arc<dyn RelationalBackend>,
    archive: Option<Arc<dyn RelationalBackend>>,
  ) -> Self {
    Self { primary, archive }
  }

  fn backend(&self, pool: PoolName) -> &Arc<dyn RelationalBackend> {
    match pool {
      PoolName::Primary => &self.primary,
      PoolName::Archive => self.archive.as_ref().unwrap_or(&self.primary),
    }
  }

  /// Run the chain; the final step's output is the transaction's result.
  pub async fn run(&self, steps: Vec<TxStep>, opts: TxOptions) -> Result<Option<Value>, EngineError> {
    if steps.is_empty() {
      return Err(EngineError::Transaction {
        step: 0,
        message: "transaction has no operations".into(),
      });
    }
    match self.run_inner(steps, opts.pool).await {
      Ok(v) => Ok(v),
      Err(e) if opts.silent_on_error => {
        tracing::error!(error = %e, "transaction failed (silenced)");
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  async fn run_inner(
    &self,
    mut steps: Vec<TxStep>,
    pool: PoolName,
  ) -> Result<Option<Value>, EngineError> {
    let mut tx = self.backend(pool).begin().await?;
    let mut carried = None;
    for (i, step) in steps.iter_mut().enumerate() {
      match step(tx.as_mut(), carried.take()).await {
        Ok(v) => carried = v,
        Err(e) => {
          if let Err(rb) = tx.rollback().await {
            tracing::error!(step = i, error = %rb, "rollback failed");
          }
          return Err(EngineError::Transaction {
            step: i,
            message: e.to_string(),
          });
        }
      }
    }
    tx.commit().await?;
    Ok(carried)
  }
}

/// Convenience wrapper for the common query-then-chain shape.
pub fn step<F>(mut f: F) -> TxStep
where
  F: for<'t> FnMut(
      &'t mut dyn RelationalTx,
      Option<Value>,
    ) -> BoxFuture<'t, Result<Option<Value>, EngineError>>
    + Send
    + 'static,
{
  Box::new(move |tx, prev| f(tx, prev))
}
