use thiserror::Error;

/// Error kinds surfaced by the engine.
///
/// Cache-read failures never reach callers (they degrade to misses) and
/// cache-write failures are logged and dropped; the variants exist so the
/// internal plumbing can classify what happened before deciding whether to
/// swallow it.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("cache read failed: {0}")]
  CacheRead(String),

  #[error("cache write failed: {0}")]
  CacheWrite(String),

  /// Transport-level store failure, classified into read/write by the
  /// layer that knows what it was doing.
  #[error("store command failed: {0}")]
  Store(String),

  #[error("query failed: {message} | SQL: {statement}")]
  Relational { statement: String, message: String },

  #[error("transaction failed at step {step}: {message}")]
  Transaction { step: usize, message: String },

  #[error("lock acquisition failed for {resources:?} after {attempts} attempts")]
  LockAcquisition { resources: Vec<String>, attempts: u32 },

  #[error("fatal connection error: {0}")]
  ConnectionFatal(String),

  #[error("pool unavailable: {0}")]
  Pool(String),

  #[error("encode/decode failed: {0}")]
  Codec(String),

  #[error("unsupported store command: {0}")]
  UnsupportedCommand(String),

  #[error("invalid configuration: {0}")]
  Config(String),
}

impl EngineError {
  /// Wrap a relational driver error together with the statement that
  /// triggered it, so diagnostics carry the failing SQL.
  pub fn relational(statement: &str, err: impl std::fmt::Display) -> Self {
    Self::Relational {
      statement: statement.to_string(),
      message: err.to_string(),
    }
  }
}
