mod pool;
mod row;

pub use pool::{PoolName, PoolSupervisor, PostgresBackend};
pub use row::{bind_params, row_to_json, SqlParam};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;

/// Seam between the engine and the relational store. `PostgresBackend` is
/// the production implementation; tests supply stubs.
#[async_trait]
pub trait RelationalBackend: Send + Sync {
  /// Run one statement, returning rows as JSON objects keyed by column.
  async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Value>, EngineError>;

  /// Run one statement, returning the affected-row count.
  async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, EngineError>;

  /// Borrow a connection and open a transaction on it.
  async fn begin(&self) -> Result<Box<dyn RelationalTx>, EngineError>;
}

/// One open transaction on one borrowed connection. The connection goes
/// back to its pool when the value drops, whichever exit path ran.
#[async_trait]
pub trait RelationalTx: Send {
  async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<Value>, EngineError>;

  async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, EngineError>;

  async fn commit(self: Box<Self>) -> Result<(), EngineError>;

  async fn rollback(self: Box<Self>) -> Result<(), EngineError>;
}
