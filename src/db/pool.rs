use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use parking_lot::RwLock;
use serde_json::Value;
use tokio_postgres::NoTls;

use super::row::{bind_params, row_to_json, SqlParam};
use super::{RelationalBackend, RelationalTx};
use crate::config::{DbSection, EngineConfig};
use crate::error::EngineError;

/// Named relational pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolName {
  #[default]
  Primary,
  Archive,
}

/// Owns the primary and archive pools. A fatal connection-level error
/// tears the affected pool down and rebuilds it; in-flight operations on
/// the dead pool fail and are the caller's to retry.
pub struct PoolSupervisor {
  primary_cfg: DbSection,
  archive_cfg: DbSection,
  primary: RwLock<Pool>,
  archive: RwLock<Option<Pool>>,
}

fn build_pool(db: &DbSection) -> Result<Pool, EngineError> {
  let mut cfg = Config::new();
  cfg.host = Some(db.host.clone());
  cfg.port = Some(db.port);
  cfg.user = Some(db.user.clone());
  cfg.password = Some(db.password.clone());
  cfg.dbname = Some(db.dbname.clone());
  cfg.manager = Some(ManagerConfig {
    recycling_method: RecyclingMethod::Fast,
  });
  cfg
    .create_pool(Some(Runtime::Tokio1), NoTls)
    .map_err(|e| EngineError::Pool(e.to_string()))
}

impl PoolSupervisor {
  /// Build the supervisor and open the primary pool. The archive pool
  /// opens lazily on first use.
  pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
    let archive_cfg = config.db_archive.resolve(&config.db);
    let primary = build_pool(&config.db)?;
    tracing::info!(host = %config.db.host, db = %config.db.dbname, "primary pool created");
    Ok(Self {
      primary_cfg: config.db.clone(),
      archive_cfg,
      primary: RwLock::new(primary),
      archive: RwLock::new(None),
    })
  }

  pub fn pool(&self, name: PoolName) -> Result<Pool, EngineError> {
    match name {
      PoolName::Primary => Ok(self.primary.read().clone()),
      PoolName::Archive => {
        if let Some(pool) = self.archive.read().as_ref() {
          return Ok(pool.clone());
        }
        let mut slot = self.archive.write();
        if let Some(pool) = slot.as_ref() {
          return Ok(pool.clone());
        }
        let pool = build_pool(&self.archive_cfg)?;
        tracing::info!(host = %self.archive_cfg.host, "archive pool created");
        *slot = Some(pool.clone());
        Ok(pool)
      }
    }
  }

  /// Tear down and rebuild a pool after a fatal connection error.
  pub fn recreate(&self, name: PoolName) -> Result<(), EngineError> {
    match name {
      PoolName::Primary => {
        let pool = build_pool(&self.primary_cfg)?;
        let old = std::mem::replace(&mut *self.primary.write(), pool);
        old.close();
        tracing::error!("primary pool recreated after fatal connection error");
      }
      PoolName::Archive => {
        let pool = build_pool(&self.archive_cfg)?;
        if let Some(old) = self.archive.write().replace(pool) {
          old.close();
        }
        tracing::error!("archive pool recreated after fatal connection error");
      }
    }
    Ok(())
  }

  /// Close the archive pool; the next archive call reopens it.
  pub fn close_archive(&self) {
    if let Some(pool) = self.archive.write().take() {
      pool.close();
      tracing::info!("archive pool closed");
    }
  }

  pub fn close(&self) {
    self.primary.read().close();
    self.close_archive();
  }
}

/// `RelationalBackend` over one named pool of the supervisor.
pub struct PostgresBackend {
  supervisor: Arc<PoolSupervisor>,
  name: PoolName,
}

impl PostgresBackend {
  pub fn new(supervisor: Arc<PoolSupervisor>, name: PoolName) -> Self {
    Self { supervisor, name }
  }

  async fn client(&self) -> Result<deadpool_postgres::Client, EngineError> {
    let pool = self.supervisor.pool(self.name)?;
    pool
      .get()
      .await
      .map_err(|e| EngineError::Pool(e.to_string()))
  }

  /// Classify a driver error; fatal connection drops recreate the pool.
  fn map_error(&self, sql: &str, e: tokio_postgres::Error) -> EngineError {
    if e.is_closed() {
      if let Err(rebuild) = self.supervisor.recreate(self.name) {
        tracing::error!(error = %rebuild, "pool rebuild failed");
      }
      EngineError::ConnectionFatal(e.to_string())
    } else {
      EngineError::relational(sql, e)
    }
  }
}

#[async_trait]
impl RelationalBackend for PostgresBackend {
  async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Value>, EngineError> {
    let client = self.client().await?;
    let rows = client
      .query(sql, &bind_params(params))
      .await
      .map_err(|e| self.map_error(sql, e))?;
    rows.iter().map(row_to_json).collect()
  }

  async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, EngineError> {
    let client = self.client().await?;
    client
      .execute(sql, &bind_params(params))
      .await
      .map_err(|e| self.map_error(sql, e))
  }

  async fn begin(&self) -> Result<Box<dyn RelationalTx>, EngineError> {
    let client = self.client().await?;
    client
      .batch_execute("BEGIN")
      .await
      .map_err(|e| EngineError::Transaction {
        step: 0,
        message: e.to_string(),
      })?;
    Ok(Box::new(PgTx { client }))
  }
}

struct PgTx {
  client: deadpool_postgres::Client,
}

#[async_trait]
impl RelationalTx for PgTx {
  async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<Value>, EngineError> {
    let rows = self
      .client
      .query(sql, &bind_params(params))
      .await
      .map_err(|e| EngineError::relational(sql, e))?;
    rows.iter().map(row_to_json).collect()
  }

  async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, EngineError> {
    self
      .client
      .execute(sql, &bind_params(params))
      .await
      .map_err(|e| EngineError::relational(sql, e))
  }

  async fn commit(self: Box<Self>) -> Result<(), EngineError> {
    self
      .client
      .batch_execute("COMMIT")
      .await
      .map_err(|e| EngineError::Transaction {
        step: usize::MAX,
        message: e.to_string(),
      })
  }

  async fn rollback(self: Box<Self>) -> Result<(), EngineError> {
    self
      .client
      .batch_execute("ROLLBACK")
      .await
      .map_err(|e| EngineError::Transaction {
        step: usize::MAX,
        message: e.to_string(),
      })
  }
}
