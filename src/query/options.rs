use std::sync::Arc;

use serde_json::Value;

use crate::cache::PackSchema;
use crate::db::PoolName;

/// A cache key that is either known up front or derived from the query
/// result after the relational fallback runs. Resolved once at the call
/// boundary; downstream code only ever sees the final string.
#[derive(Clone)]
pub enum KeySpec {
  Fixed(String),
  Derived(Arc<dyn Fn(&Value) -> String + Send + Sync>),
}

impl KeySpec {
  pub fn fixed(&self) -> Option<&str> {
    match self {
      KeySpec::Fixed(s) => Some(s),
      KeySpec::Derived(_) => None,
    }
  }

  pub fn resolve(&self, result: &Value) -> String {
    match self {
      KeySpec::Fixed(s) => s.clone(),
      KeySpec::Derived(f) => f(result),
    }
  }
}

impl From<&str> for KeySpec {
  fn from(v: &str) -> Self {
    KeySpec::Fixed(v.to_string())
  }
}

impl From<String> for KeySpec {
  fn from(v: String) -> Self {
    KeySpec::Fixed(v)
  }
}

impl std::fmt::Debug for KeySpec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      KeySpec::Fixed(s) => write!(f, "Fixed({:?})", s),
      KeySpec::Derived(_) => write!(f, "Derived(..)"),
    }
  }
}

/// Collection shape of the cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Multiplicity {
  #[default]
  None,
  List,
  Set,
}

/// Synchronous transform applied to a cache hit before returning it.
pub type PostReadTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Per-call cache configuration. Every recognized knob is an explicit
/// typed field; construction starts from `Default` and flows through the
/// `with_*` helpers.
#[derive(Clone, Default)]
pub struct CacheOptions {
  pub key: Option<KeySpec>,
  pub field: Option<KeySpec>,
  /// JSON-document path; selecting it turns field/collection modes off.
  pub path: Option<String>,
  pub multiplicity: Multiplicity,
  pub pack_schema: Option<PackSchema>,
  /// Cycle-safe JSON encoding instead of plain JSON.
  pub cycle_safe: bool,
  pub skip_read: bool,
  pub post_read_transform: Option<PostReadTransform>,
  /// None = engine default; 0 = no expiration management.
  pub ttl_seconds: Option<u64>,
  /// Never shorten an existing TTL.
  pub preserve_ttl: bool,
  /// Dotted `key.field` paths deleted after a successful write.
  pub invalidate_keys: Vec<String>,
  pub silent_on_error: bool,
  pub wait_for_cache_write: bool,
  /// After the fallback populates the cache, re-read once and return the
  /// cached rendition. Bounded to a single attempt; implies waiting for
  /// the cache write.
  pub reread_after_write: bool,
  /// Opaque passthrough handed to the transform.
  pub auxiliary_data: Option<Value>,
  pub pool: PoolName,
}

impl CacheOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn keyed(key: impl Into<KeySpec>) -> Self {
    Self {
      key: Some(key.into()),
      ..Self::default()
    }
  }

  pub fn derived_key(f: impl Fn(&Value) -> String + Send + Sync + 'static) -> Self {
    Self {
      key: Some(KeySpec::Derived(Arc::new(f))),
      ..Self::default()
    }
  }

  pub fn with_field(mut self, field: impl Into<KeySpec>) -> Self {
    self.field = Some(field.into());
    self
  }

  pub fn with_path(mut self, path: impl Into<String>) -> Self {
    self.path = Some(path.into());
    self
  }

  pub fn with_multiplicity(mut self, m: Multiplicity) -> Self {
    self.multiplicity = m;
    self
  }

  pub fn with_pack_schema(mut self, schema: PackSchema) -> Self {
    self.pack_schema = Some(schema);
    self
  }

  pub fn cycle_safe(mut self) -> Self {
    self.cycle_safe = true;
    self
  }

  pub fn skip_read(mut self) -> Self {
    self.skip_read = true;
    self
  }

  pub fn with_ttl(mut self, seconds: u64) -> Self {
    self.ttl_seconds = Some(seconds);
    self
  }

  pub fn preserve_ttl(mut self) -> Self {
    self.preserve_ttl = true;
    self
  }

  pub fn invalidating<I, S>(mut self, paths: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.invalidate_keys = paths.into_iter().map(Into::into).collect();
    self
  }

  pub fn silent(mut self) -> Self {
    self.silent_on_error = true;
    self
  }

  pub fn wait_for_cache_write(mut self) -> Self {
    self.wait_for_cache_write = true;
    self
  }

  pub fn reread_after_write(mut self) -> Self {
    self.reread_after_write = true;
    self.wait_for_cache_write = true;
    self
  }

  pub fn with_post_read(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
    self.post_read_transform = Some(Arc::new(f));
    self
  }

  pub fn with_aux(mut self, aux: Value) -> Self {
    self.auxiliary_data = Some(aux);
    self
  }

  pub fn on_pool(mut self, pool: PoolName) -> Self {
    self.pool = pool;
    self
  }
}

/// Resolved read/write method pair and serialization format.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
  /// GET/SET of one packed record.
  PackedScalar(PackSchema),
  /// LRANGE/RPUSH of packed records.
  PackedList(PackSchema),
  /// SMEMBERS/SADD of packed records.
  PackedSet(PackSchema),
  /// JSON.GET/JSON.SET at a normalized document path.
  JsonPath(String),
  /// HGET/HSET of one hash field.
  HashField,
  /// LRANGE/RPUSH of JSON-encoded elements.
  JsonList,
  /// SMEMBERS/SADD of JSON-encoded elements.
  JsonSet,
  /// GET/SET of one JSON-encoded value.
  Scalar,
}

impl Strategy {
  /// Select the method pair for a call. Decision order: packed record >
  /// document path > hash field > collection > plain scalar. Path mode
  /// normalizes the mutually exclusive knobs off.
  pub fn resolve(options: &mut CacheOptions) -> Option<Strategy> {
    options.key.as_ref()?;
    if let Some(schema) = &options.pack_schema {
      return Some(match options.multiplicity {
        Multiplicity::List => Strategy::PackedList(schema.clone()),
        Multiplicity::Set => Strategy::PackedSet(schema.clone()),
        Multiplicity::None => Strategy::PackedScalar(schema.clone()),
      });
    }
    if let Some(path) = options.path.take() {
      let path = crate::cache::normalize_json_path(&path);
      options.path = Some(path.clone());
      options.field = None;
      options.multiplicity = Multiplicity::None;
      options.cycle_safe = false;
      return Some(Strategy::JsonPath(path));
    }
    if options.field.is_some() {
      return Some(Strategy::HashField);
    }
    match options.multiplicity {
      Multiplicity::List => Some(Strategy::JsonList),
      Multiplicity::Set => Some(Strategy::JsonSet),
      Multiplicity::None => Some(Strategy::Scalar),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn no_key_means_no_strategy() {
    let mut opts = CacheOptions::new();
    assert!(Strategy::resolve(&mut opts).is_none());
  }

  #[test]
  fn pack_wins_over_everything() {
    let mut opts = CacheOptions::keyed("k")
      .with_pack_schema(PackSchema::new(["a"]))
      .with_path("x")
      .with_field("f");
    assert!(matches!(
      Strategy::resolve(&mut opts),
      Some(Strategy::PackedScalar(_))
    ));
  }

  #[test]
  fn path_normalizes_exclusive_flags() {
    let mut opts = CacheOptions::keyed("k")
      .with_path("profile.name")
      .with_field("f")
      .with_multiplicity(Multiplicity::Set)
      .cycle_safe();
    let strategy = Strategy::resolve(&mut opts);
    assert_eq!(strategy, Some(Strategy::JsonPath("$.profile.name".into())));
    assert!(opts.field.is_none());
    assert_eq!(opts.multiplicity, Multiplicity::None);
    assert!(!opts.cycle_safe);
  }

  #[test]
  fn field_beats_collection() {
    let mut opts = CacheOptions::keyed("k")
      .with_field("f")
      .with_multiplicity(Multiplicity::List);
    assert_eq!(Strategy::resolve(&mut opts), Some(Strategy::HashField));
  }

  #[test]
  fn collection_and_scalar() {
    let mut list = CacheOptions::keyed("k").with_multiplicity(Multiplicity::List);
    assert_eq!(Strategy::resolve(&mut list), Some(Strategy::JsonList));
    let mut scalar = CacheOptions::keyed("k");
    assert_eq!(Strategy::resolve(&mut scalar), Some(Strategy::Scalar));
  }

  #[test]
  fn packed_collection_pairs() {
    let mut opts = CacheOptions::keyed("k")
      .with_pack_schema(PackSchema::new(["a"]))
      .with_multiplicity(Multiplicity::Set);
    assert!(matches!(
      Strategy::resolve(&mut opts),
      Some(Strategy::PackedSet(_))
    ));
  }
}
