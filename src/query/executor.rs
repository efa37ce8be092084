use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::options::{CacheOptions, KeySpec, Strategy};
use crate::cache::flat;
use crate::cache::{normalize_json_path, run_pipeline, Command, KeyRouter, Reply, Store};
use crate::db::{PoolName, RelationalBackend, SqlParam};
use crate::error::EngineError;

/// Async transform applied to the relational rows before caching and
/// returning. Receives the rows and the call's auxiliary data.
pub type QueryTransform =
  Box<dyn FnOnce(Vec<Value>, Option<Value>) -> BoxFuture<'static, Result<Value, EngineError>> + Send>;

/// Options for [`QueryExecutor::json_get`].
#[derive(Default)]
pub struct JsonGetOptions {
  /// Keep a single-element array instead of unwrapping it.
  pub keep_array: bool,
  /// Treat an empty array at the path as a miss.
  pub empty_array_null: bool,
  /// Fallback executed on a miss.
  pub fallback: Option<JsonFallback>,
  /// After the fallback populates the document, re-read once and return
  /// the cached rendition. One attempt, never recursive.
  pub rerun: bool,
}

/// Relational fallback for a JSON-document miss.
pub struct JsonFallback {
  pub sql: String,
  pub params: Vec<SqlParam>,
  pub transform: Option<QueryTransform>,
  pub options: CacheOptions,
}

/// The central orchestrator: cache read, relational fallback, transform,
/// write-back with TTL policy, secondary invalidation.
pub struct QueryExecutor {
  store: Arc<dyn Store>,
  router: KeyRouter,
  primary: Arc<dyn RelationalBackend>,
  archive: Option<Arc<dyn RelationalBackend>>,
  default_ttl: u64,
}

impl QueryExecutor {
  pub fn new(
    store: Arc<dyn Store>,
    router: KeyRouter,
    primary: Arc<dyn RelationalBackend>,
    archive: Option<Arc<dyn RelationalBackend>>,
    default_ttl: u64,
  ) -> Self {
    Self {
      store,
      router,
      primary,
      archive,
      default_ttl,
    }
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn router(&self) -> &KeyRouter {
    &self.router
  }

  fn backend(&self, pool: PoolName) -> &Arc<dyn RelationalBackend> {
    match pool {
      PoolName::Primary => &self.primary,
      PoolName::Archive => self.archive.as_ref().unwrap_or(&self.primary),
    }
  }

  /// Execute a query through the cache-aside path.
  ///
  /// Returns `None` when there is nothing to return: a silenced error, or
  /// no SQL and no cached value.
  pub async fn execute(
    &self,
    sql: &str,
    params: &[SqlParam],
    transform: Option<QueryTransform>,
    options: CacheOptions,
  ) -> Result<Option<Value>, EngineError> {
    let mut options = options;
    let strategy = Strategy::resolve(&mut options);

    // 1-2. Cache read; a store error degrades to a miss. A derived key
    // cannot be known before the fallback runs, so it skips the read.
    if let Some(strategy) = &strategy {
      if !options.skip_read {
        if let Some(key) = options.key.as_ref().and_then(KeySpec::fixed) {
          match self.cache_read(strategy, key, &options).await {
            Ok(Some(hit)) => {
              return Ok(Some(apply_post_read(&options, hit)));
            }
            Ok(None) => {}
            Err(e) => {
              tracing::warn!(key, error = %e, "cache read failed, treating as miss");
            }
          }
        }
      }
    }

    // 3. Relational fallback.
    if sql.is_empty() {
      return Ok(None);
    }
    let rows = match self.backend(options.pool).query(sql, params).await {
      Ok(rows) => rows,
      Err(e) => {
        if options.silent_on_error {
          tracing::error!(error = %e, "query failed (silenced)");
          return Ok(None);
        }
        return Err(e);
      }
    };

    // 4. Result transform.
    let result = match transform {
      Some(t) => match t(rows, options.auxiliary_data.clone()).await {
        Ok(v) => v,
        Err(e) => {
          if options.silent_on_error {
            tracing::error!(error = %e, "transform failed (silenced)");
            return Ok(None);
          }
          return Err(e);
        }
      },
      None => Value::Array(rows),
    };

    // 5-6. Invalidation fan-out plus write-back, one pipeline.
    let mut commands = invalidation_commands(&options.invalidate_keys);
    let mut written_key = None;
    if let Some(strategy) = &strategy {
      if !result.is_null() {
        let key = options
          .key
          .as_ref()
          .map(|k| k.resolve(&result))
          .unwrap_or_default();
        let write = self.write_commands(strategy, &key, &result, &options).await?;
        commands.extend(write);
        written_key = Some(key);
      }
    }

    if !commands.is_empty() {
      if options.wait_for_cache_write {
        if let Err(e) = run_pipeline(&self.store, &self.router, commands).await {
          tracing::warn!(error = %e, "cache write failed, result served from relational store");
        }
      } else {
        let store = Arc::clone(&self.store);
        let router = self.router.clone();
        tokio::spawn(async move {
          if let Err(e) = run_pipeline(&store, &router, commands).await {
            tracing::warn!(error = %e, "cache write failed");
          }
        });
      }
    }

    // Explicit bounded rerun: at most one re-read after the write.
    if options.reread_after_write {
      if let (Some(strategy), Some(key)) = (&strategy, written_key.as_deref()) {
        if let Ok(Some(hit)) = self.cache_read(strategy, key, &options).await {
          return Ok(Some(apply_post_read(&options, hit)));
        }
      }
    }

    Ok(Some(result))
  }

  async fn cache_read(
    &self,
    strategy: &Strategy,
    key: &str,
    options: &CacheOptions,
  ) -> Result<Option<Value>, EngineError> {
    let routed = self.router.route(key);
    let hit = match strategy {
      Strategy::Scalar => {
        let reply = self.store.dispatch(Command::new("get", routed)).await?;
        match reply.as_text() {
          Some(text) => Some(decode_json(text, options.cycle_safe)?),
          None => None,
        }
      }
      Strategy::PackedScalar(schema) => {
        let reply = self.store.dispatch(Command::new("get", routed)).await?;
        match reply.as_bytes() {
          Some(b) => Some(schema.unpack(b)?),
          None => None,
        }
      }
      Strategy::HashField => {
        // A derived field is resolved against the fallback result, so a
        // read has nothing to address yet.
        let Some(field) = options.field.as_ref().and_then(KeySpec::fixed) else {
          return Ok(None);
        };
        let reply = self
          .store
          .dispatch(Command::new("hget", routed).arg(field))
          .await?;
        match reply.as_text() {
          Some(text) => Some(decode_json(text, options.cycle_safe)?),
          None => None,
        }
      }
      Strategy::JsonPath(path) => {
        let reply = self
          .store
          .dispatch(Command::new("JSON.GET", routed).arg(path.as_str()))
          .await?;
        match reply.as_text() {
          Some(text) => {
            let parsed: Value =
              serde_json::from_str(text).map_err(|e| EngineError::Codec(e.to_string()))?;
            Some(unwrap_single(parsed))
          }
          None => None,
        }
      }
      Strategy::JsonList => {
        let reply = self
          .store
          .dispatch(Command::new("lrange", routed).arg(0i64).arg(-1i64))
          .await?;
        decode_elements(reply, |r| {
          r.as_text()
            .ok_or_else(|| EngineError::Codec("non-text list element".into()))
            .and_then(|t| decode_json(t, options.cycle_safe))
        })?
      }
      Strategy::JsonSet => {
        let reply = self
          .store
          .dispatch(Command::new("smembers", routed))
          .await?;
        decode_elements(reply, |r| {
          r.as_text()
            .ok_or_else(|| EngineError::Codec("non-text set member".into()))
            .and_then(|t| decode_json(t, options.cycle_safe))
        })?
      }
      Strategy::PackedList(schema) => {
        let reply = self
          .store
          .dispatch(Command::new("lrange", routed).arg(0i64).arg(-1i64))
          .await?;
        decode_elements(reply, |r| {
          r.as_bytes()
            .ok_or_else(|| EngineError::Codec("non-binary list element".into()))
            .and_then(|b| schema.unpack(b))
        })?
      }
      Strategy::PackedSet(schema) => {
        let reply = self
          .store
          .dispatch(Command::new("smembers", routed))
          .await?;
        decode_elements(reply, |r| {
          r.as_bytes()
            .ok_or_else(|| EngineError::Codec("non-binary set member".into()))
            .and_then(|b| schema.unpack(b))
        })?
      }
    };
    Ok(hit.filter(|v| !v.is_null()))
  }

  /// Build the write-back commands for a transformed result, applying the
  /// TTL policy: scalar SETs carry EX inline, everything else gets an
  /// EXPIRE in the same batch, skipped under preserve_ttl while a positive
  /// TTL remains.
  async fn write_commands(
    &self,
    strategy: &Strategy,
    key: &str,
    result: &Value,
    options: &CacheOptions,
  ) -> Result<Vec<Command>, EngineError> {
    let ttl = options.ttl_seconds.unwrap_or(self.default_ttl);
    let mut out = Vec::new();

    match strategy {
      Strategy::Scalar | Strategy::PackedScalar(_) => {
        let mut cmd = Command::new("set", key);
        cmd = match strategy {
          Strategy::PackedScalar(schema) => cmd.arg(schema.pack(result)?),
          _ => cmd.arg(encode_json(result, options.cycle_safe)?),
        };
        if ttl > 0 {
          if options.preserve_ttl && self.remaining_ttl(key).await > 0 {
            cmd = cmd.arg("KEEPTTL");
          } else {
            cmd = cmd.arg("EX").arg(ttl);
          }
        }
        out.push(cmd);
        return Ok(out);
      }
      Strategy::HashField => {
        let field = options
          .field
          .as_ref()
          .map(|f| f.resolve(result))
          .unwrap_or_default();
        out.push(
          Command::new("hset", key)
            .arg(field)
            .arg(encode_json(result, options.cycle_safe)?),
        );
      }
      Strategy::JsonPath(path) => {
        let text =
          serde_json::to_string(result).map_err(|e| EngineError::Codec(e.to_string()))?;
        out.push(Command::new("JSON.SET", key).arg(path.as_str()).arg(text));
      }
      Strategy::JsonList | Strategy::JsonSet => {
        let method = if matches!(strategy, Strategy::JsonList) {
          "rpush"
        } else {
          "sadd"
        };
        let mut cmd = Command::new(method, key);
        for item in as_elements(result) {
          cmd = cmd.arg(encode_json(item, options.cycle_safe)?);
        }
        out.push(cmd);
      }
      Strategy::PackedList(schema) | Strategy::PackedSet(schema) => {
        let method = if matches!(strategy, Strategy::PackedList(_)) {
          "rpush"
        } else {
          "sadd"
        };
        let mut cmd = Command::new(method, key);
        for item in as_elements(result) {
          cmd = cmd.arg(schema.pack(item)?);
        }
        out.push(cmd);
      }
    }

    if ttl > 0 {
      let skip = options.preserve_ttl && self.remaining_ttl(key).await > 0;
      if !skip {
        out.push(Command::new("expire", key).arg(ttl));
      }
    }
    Ok(out)
  }

  // Best-effort: a store error here must not fail a call that already has
  // its relational result, so it reads as "no TTL remaining".
  async fn remaining_ttl(&self, key: &str) -> i64 {
    let routed = self.router.route(key);
    match self.store.dispatch(Command::new("ttl", routed)).await {
      Ok(reply) => reply.as_int().unwrap_or(-2),
      Err(e) => {
        tracing::warn!(key, error = %e, "ttl probe failed, writing fresh expiry");
        -2
      }
    }
  }

  /// HMGET with per-field pairing: returns an object mapping each
  /// requested field to its value (null when absent).
  pub async fn hash_multi_get(
    &self,
    key: &str,
    fields: &[&str],
    numeric: bool,
  ) -> Result<Value, EngineError> {
    let routed = self.router.route(key);
    let reply = self
      .store
      .dispatch(Command::new("hmget", routed).args(fields.iter().copied()))
      .await?;
    let values = reply.into_array();
    let mut out = serde_json::Map::with_capacity(fields.len());
    for (i, field) in fields.iter().enumerate() {
      let v = match values.get(i) {
        Some(Reply::Nil) | None => Value::Null,
        Some(r) => match r.as_text() {
          Some(t) if numeric => t
            .parse::<f64>()
            .ok()
            .and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
            .unwrap_or(Value::Null),
          Some(t) => Value::String(t.to_string()),
          None => Value::Null,
        },
      };
      out.insert((*field).to_string(), v);
    }
    Ok(Value::Object(out))
  }

  /// JSON-document read with optional relational fallback.
  ///
  /// A missing key reads as null; a missing path on an existing key reads
  /// as an empty array (opt into `empty_array_null` to treat it as a
  /// miss). Single-element arrays unwrap unless `keep_array` is set.
  pub async fn json_get(
    &self,
    key: &str,
    path: &str,
    mut opts: JsonGetOptions,
  ) -> Result<Option<Value>, EngineError> {
    let routed = self.router.route(key);
    let path = normalize_json_path(path);

    if let Some(value) = self.json_read_once(&routed, &path, &opts).await? {
      return Ok(Some(value));
    }

    let Some(fallback) = opts.fallback.take() else {
      return Ok(None);
    };
    let populated = self
      .execute(
        &fallback.sql,
        &fallback.params,
        fallback.transform,
        fallback.options.wait_for_cache_write(),
      )
      .await?;
    if !opts.rerun {
      return Ok(populated);
    }
    // One re-read after the fallback populated the document; never loops.
    self.json_read_once(&routed, &path, &opts).await
  }

  async fn json_read_once(
    &self,
    routed: &str,
    path: &str,
    opts: &JsonGetOptions,
  ) -> Result<Option<Value>, EngineError> {
    let mut value = match self
      .store
      .dispatch(Command::new("JSON.GET", routed).arg(path))
      .await
    {
      Ok(reply) => match reply.as_text() {
        Some(text) => {
          serde_json::from_str::<Value>(text).map_err(|e| EngineError::Codec(e.to_string()))?
        }
        None => Value::Null,
      },
      Err(e) => {
        tracing::warn!(key = %routed, error = %e, "json read failed, treating as miss");
        Value::Null
      }
    };
    if opts.empty_array_null && value.as_array().map(|a| a.is_empty()).unwrap_or(false) {
      value = Value::Null;
    }
    if value.is_null() {
      return Ok(None);
    }
    if !opts.keep_array {
      value = unwrap_single(value);
    }
    Ok(Some(value))
  }

  /// JSON-document write, optionally written through to the relational
  /// store in the same call.
  pub async fn json_set(
    &self,
    key: &str,
    path: &str,
    value: &Value,
    write_through: Option<(&str, &[SqlParam])>,
  ) -> Result<(), EngineError> {
    let routed = self.router.route(key);
    let path = normalize_json_path(path);
    let text = serde_json::to_string(value).map_err(|e| EngineError::Codec(e.to_string()))?;
    self
      .store
      .dispatch(Command::new("JSON.SET", routed).arg(path).arg(text))
      .await?;
    if let Some((sql, params)) = write_through {
      self.backend(PoolName::Primary).execute(sql, params).await?;
    }
    Ok(())
  }
}

fn apply_post_read(options: &CacheOptions, value: Value) -> Value {
  match &options.post_read_transform {
    Some(f) => f(value),
    None => value,
  }
}

/// Dotted `key.field` paths become hash-field deletes; bare keys become
/// plain deletes.
pub(crate) fn invalidation_commands(paths: &[String]) -> Vec<Command> {
  let mut out = Vec::with_capacity(paths.len());
  for path in paths {
    if path.is_empty() {
      continue;
    }
    match path.split_once('.') {
      Some((key, field)) => out.push(Command::new("hdel", key).arg(field)),
      None => out.push(Command::new("del", path.as_str())),
    }
  }
  out
}

fn encode_json(value: &Value, cycle_safe: bool) -> Result<String, EngineError> {
  if cycle_safe {
    flat::encode(value)
  } else {
    serde_json::to_string(value).map_err(|e| EngineError::Codec(e.to_string()))
  }
}

/// Parse a cached payload; a payload that is not valid JSON is served as
/// the raw string rather than failing the read.
fn decode_json(text: &str, cycle_safe: bool) -> Result<Value, EngineError> {
  if cycle_safe {
    flat::decode(text)
  } else {
    Ok(
      serde_json::from_str(text)
        .unwrap_or_else(|_| Value::String(text.to_string())),
    )
  }
}

fn unwrap_single(value: Value) -> Value {
  match value {
    Value::Array(mut items) if items.len() == 1 => items.pop().unwrap(),
    other => other,
  }
}

fn as_elements(result: &Value) -> Vec<&Value> {
  match result {
    Value::Array(items) => items.iter().collect(),
    other => vec![other],
  }
}

/// Collection read: an empty page is a miss, a populated one decodes
/// element by element.
fn decode_elements<F>(reply: Reply, mut decode: F) -> Result<Option<Value>, EngineError>
where
  F: FnMut(&Reply) -> Result<Value, EngineError>,
{
  let items = reply.into_array();
  if items.is_empty() {
    return Ok(None);
  }
  let mut out = Vec::with_capacity(items.len());
  for item in &items {
    out.push(decode(item)?);
  }
  Ok(Some(Value::Array(out)))
}
