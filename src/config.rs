use serde::{Deserialize, Serialize};

/// Relational credential section. The archive section may leave any field
/// unset to inherit the primary value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSection {
  #[serde(default = "default_db_host")]
  pub host: String,
  #[serde(default = "default_db_port")]
  pub port: u16,
  #[serde(default)]
  pub user: String,
  #[serde(default)]
  pub password: String,
  #[serde(default)]
  pub dbname: String,
}

impl Default for DbSection {
  fn default() -> Self {
    Self {
      host: default_db_host(),
      port: default_db_port(),
      user: String::new(),
      password: String::new(),
      dbname: String::new(),
    }
  }
}

fn default_db_host() -> String {
  "127.0.0.1".into()
}

fn default_db_port() -> u16 {
  5432
}

/// Partial credential section for the archive database; unset fields fall
/// back to the primary section field-by-field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveSection {
  pub host: Option<String>,
  pub port: Option<u16>,
  pub user: Option<String>,
  pub password: Option<String>,
  pub dbname: Option<String>,
}

impl ArchiveSection {
  /// Materialize a full section, inheriting missing fields from `primary`.
  pub fn resolve(&self, primary: &DbSection) -> DbSection {
    DbSection {
      host: self.host.clone().unwrap_or_else(|| primary.host.clone()),
      port: self.port.unwrap_or(primary.port),
      user: self.user.clone().unwrap_or_else(|| primary.user.clone()),
      password: self
        .password
        .clone()
        .unwrap_or_else(|| primary.password.clone()),
      dbname: self.dbname.clone().unwrap_or_else(|| primary.dbname.clone()),
    }
  }
}

/// Distributed lock tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
  /// Maximum acquisition attempts before giving up.
  #[serde(default = "default_lock_retry_count")]
  pub retry_count: u32,
  /// Base delay between attempts, milliseconds.
  #[serde(default = "default_lock_retry_delay_ms")]
  pub retry_delay_ms: u64,
  /// Random jitter added to each delay, milliseconds.
  #[serde(default = "default_lock_retry_jitter_ms")]
  pub retry_jitter_ms: u64,
  /// Clock-drift compensation as a fraction of the lease.
  #[serde(default = "default_lock_drift_factor")]
  pub drift_factor: f64,
  /// Remaining validity below which a held lock is auto-extended, ms.
  #[serde(default = "default_lock_extend_threshold_ms")]
  pub extend_threshold_ms: u64,
}

impl Default for LockSection {
  fn default() -> Self {
    Self {
      retry_count: default_lock_retry_count(),
      retry_delay_ms: default_lock_retry_delay_ms(),
      retry_jitter_ms: default_lock_retry_jitter_ms(),
      drift_factor: default_lock_drift_factor(),
      extend_threshold_ms: default_lock_extend_threshold_ms(),
    }
  }
}

fn default_lock_retry_count() -> u32 {
  100
}

fn default_lock_retry_delay_ms() -> u64 {
  200
}

fn default_lock_retry_jitter_ms() -> u64 {
  100
}

fn default_lock_drift_factor() -> f64 {
  0.01
}

fn default_lock_extend_threshold_ms() -> u64 {
  300
}

/// Engine configuration. Every recognized field is explicit and typed;
/// unknown fields are rejected at deserialization time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
  /// Connection string for the cache store.
  #[serde(default = "default_redis_url")]
  pub redis_url: String,
  /// Route keys through a cluster-aware client.
  #[serde(default)]
  pub cluster_mode: bool,
  /// Prefix applied to every cache key (empty = no prefixing).
  #[serde(default)]
  pub key_prefix: String,
  /// Default TTL attached to cache writes when the caller sets none.
  /// Zero disables expiration management.
  #[serde(default)]
  pub default_ttl_seconds: u64,
  #[serde(default)]
  pub db: DbSection,
  #[serde(default)]
  pub db_archive: ArchiveSection,
  #[serde(default)]
  pub lock: LockSection,
}

fn default_redis_url() -> String {
  "redis://127.0.0.1:6379".into()
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      redis_url: default_redis_url(),
      cluster_mode: false,
      key_prefix: String::new(),
      default_ttl_seconds: 0,
      db: DbSection::default(),
      db_archive: ArchiveSection::default(),
      lock: LockSection::default(),
    }
  }
}

impl EngineConfig {
  /// Build a configuration from environment variables, mirroring the
  /// deployment surface: REDIS_CONNECTION, REDIS_CLUSTER, REDIS_HPREFIX,
  /// REDIS_EXPIRE, DB_* and DB_*_ARCHIVE.
  pub fn from_env() -> Self {
    let env = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());

    let mut cfg = Self::default();
    if let Some(url) = env("REDIS_CONNECTION") {
      cfg.redis_url = url;
    }
    cfg.cluster_mode = env("REDIS_CLUSTER")
      .and_then(|v| v.parse::<i64>().ok())
      .map(|v| v != 0)
      .unwrap_or(false);
    if let Some(prefix) = env("REDIS_HPREFIX") {
      cfg.key_prefix = prefix;
    }
    if let Some(ttl) = env("REDIS_EXPIRE").and_then(|v| v.parse().ok()) {
      cfg.default_ttl_seconds = ttl;
    }

    if let Some(host) = env("DB_HOSTNAME") {
      cfg.db.host = host;
    }
    if let Some(port) = env("DB_PORT").and_then(|v| v.parse().ok()) {
      cfg.db.port = port;
    }
    if let Some(user) = env("DB_USERNAME") {
      cfg.db.user = user;
    }
    if let Some(password) = env("DB_PASSWORD") {
      cfg.db.password = password;
    }
    if let Some(name) = env("DB_NAME") {
      cfg.db.dbname = name;
    }

    cfg.db_archive = ArchiveSection {
      host: env("DB_HOSTNAME_ARCHIVE"),
      port: env("DB_PORT_ARCHIVE").and_then(|v| v.parse().ok()),
      user: env("DB_USERNAME_ARCHIVE"),
      password: env("DB_PASSWORD_ARCHIVE"),
      dbname: env("DB_NAME_ARCHIVE"),
    };

    if let Some(retries) = env("RLOCK_RETRY_COUNT").and_then(|v| v.parse().ok()) {
      cfg.lock.retry_count = retries;
    }

    cfg
  }
}
