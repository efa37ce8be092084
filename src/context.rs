use std::sync::Arc;

use serde_json::Value;

use crate::bulk::BulkOps;
use crate::cache::{KeyRouter, MemoryStore, RedisStore, Scanner, Store};
use crate::config::EngineConfig;
use crate::db::{PoolName, PoolSupervisor, PostgresBackend, RelationalBackend};
use crate::error::EngineError;
use crate::events::{EventProducer, Publisher};
use crate::lock::LockManager;
use crate::query::{QueryExecutor, TransactionRunner};

/// Wired-up engine: one cache store, one pool supervisor, and the
/// components built on top of them. Cheap to clone pieces out of; the
/// context itself is usually held in an `Arc` for the process lifetime.
pub struct EngineContext {
  config: EngineConfig,
  store: Arc<dyn Store>,
  router: KeyRouter,
  supervisor: Option<Arc<PoolSupervisor>>,
  primary: Arc<dyn RelationalBackend>,
  archive: Option<Arc<dyn RelationalBackend>>,
  lock: Arc<LockManager>,
  publisher: Option<Arc<dyn Publisher>>,
}

impl EngineContext {
  /// Connect to the configured stores and wire the engine.
  pub async fn open(config: EngineConfig) -> Result<Self, EngineError> {
    let store: Arc<dyn Store> = if config.cluster_mode {
      let urls = config
        .redis_url
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
      Arc::new(RedisStore::connect_cluster(urls).await?)
    } else {
      Arc::new(RedisStore::connect(&config.redis_url).await?)
    };

    let supervisor = Arc::new(PoolSupervisor::new(&config)?);
    let primary: Arc<dyn RelationalBackend> = Arc::new(PostgresBackend::new(
      Arc::clone(&supervisor),
      PoolName::Primary,
    ));
    let archive: Arc<dyn RelationalBackend> = Arc::new(PostgresBackend::new(
      Arc::clone(&supervisor),
      PoolName::Archive,
    ));

    Ok(Self::wire(
      config,
      store,
      Some(supervisor),
      primary,
      Some(archive),
    ))
  }

  /// Wire the engine over caller-supplied backends. Used for embedded
  /// setups and tests; pairs naturally with [`MemoryStore`].
  pub fn with_backends(
    config: EngineConfig,
    store: Arc<dyn Store>,
    primary: Arc<dyn RelationalBackend>,
    archive: Option<Arc<dyn RelationalBackend>>,
  ) -> Self {
    Self::wire(config, store, None, primary, archive)
  }

  /// In-memory rendition for tests: memory store plus the given backend.
  pub fn in_memory(config: EngineConfig, primary: Arc<dyn RelationalBackend>) -> Self {
    Self::wire(config, Arc::new(MemoryStore::new()), None, primary, None)
  }

  fn wire(
    config: EngineConfig,
    store: Arc<dyn Store>,
    supervisor: Option<Arc<PoolSupervisor>>,
    primary: Arc<dyn RelationalBackend>,
    archive: Option<Arc<dyn RelationalBackend>>,
  ) -> Self {
    let router = KeyRouter::new(config.key_prefix.clone());
    let lock = Arc::new(LockManager::single(
      Arc::clone(&store),
      router.clone(),
      config.lock.clone(),
    ));
    Self {
      config,
      store,
      router,
      supervisor,
      primary,
      archive,
      lock,
      publisher: None,
    }
  }

  pub fn set_publisher(&mut self, publisher: Arc<dyn Publisher>) {
    self.publisher = Some(publisher);
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn store(&self) -> Arc<dyn Store> {
    Arc::clone(&self.store)
  }

  pub fn router(&self) -> KeyRouter {
    self.router.clone()
  }

  pub fn executor(&self) -> QueryExecutor {
    QueryExecutor::new(
      Arc::clone(&self.store),
      self.router.clone(),
      Arc::clone(&self.primary),
      self.archive.clone(),
      self.config.default_ttl_seconds,
    )
  }

  pub fn transactions(&self) -> TransactionRunner {
    TransactionRunner::new(Arc::clone(&self.primary), self.archive.clone())
  }

  pub fn locks(&self) -> Arc<LockManager> {
    Arc::clone(&self.lock)
  }

  pub fn scanner(&self) -> Scanner {
    Scanner::new(Arc::clone(&self.store), self.router.clone())
  }

  pub fn bulk(&self) -> BulkOps {
    BulkOps::new(
      Arc::clone(&self.store),
      self.router.clone(),
      Arc::clone(&self.primary),
    )
  }

  pub fn events(&self) -> EventProducer {
    EventProducer::new(Arc::clone(&self.store), self.router.clone())
  }

  /// Forward to the registered pub/sub transport.
  pub async fn publish(&self, channel: &str, data: &Value) -> Result<(), EngineError> {
    match &self.publisher {
      Some(p) => p.publish(channel, data).await,
      None => Err(EngineError::Config("no publisher registered".into())),
    }
  }

  /// Close the relational pools. The cache connection drops with the
  /// context.
  pub fn close(&self) {
    if let Some(supervisor) = &self.supervisor {
      supervisor.close();
      tracing::info!("engine context closed");
    }
  }
}
