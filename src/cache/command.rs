use async_trait::async_trait;

use crate::error::EngineError;

/// A single positional command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
  Str(String),
  Int(i64),
  Float(f64),
  Bytes(Vec<u8>),
}

impl From<&str> for Arg {
  fn from(v: &str) -> Self {
    Arg::Str(v.to_string())
  }
}

impl From<String> for Arg {
  fn from(v: String) -> Self {
    Arg::Str(v)
  }
}

impl From<i64> for Arg {
  fn from(v: i64) -> Self {
    Arg::Int(v)
  }
}

impl From<u64> for Arg {
  fn from(v: u64) -> Self {
    Arg::Int(v as i64)
  }
}

impl From<f64> for Arg {
  fn from(v: f64) -> Self {
    Arg::Float(v)
  }
}

impl From<Vec<u8>> for Arg {
  fn from(v: Vec<u8>) -> Self {
    Arg::Bytes(v)
  }
}

/// An ordered (method, key, args...) tuple, dispatched immediately or
/// appended to a batch.
#[derive(Debug, Clone)]
pub struct Command {
  pub method: String,
  pub key: String,
  pub args: Vec<Arg>,
}

impl Command {
  pub fn new(method: &str, key: impl Into<String>) -> Self {
    Self {
      method: method.to_string(),
      key: key.into(),
      args: Vec::new(),
    }
  }

  pub fn arg(mut self, a: impl Into<Arg>) -> Self {
    self.args.push(a.into());
    self
  }

  pub fn args<I, A>(mut self, it: I) -> Self
  where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
  {
    self.args.extend(it.into_iter().map(Into::into));
    self
  }
}

/// Store reply, mirroring the wire shapes the engine consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
  Nil,
  Int(i64),
  Text(String),
  Bytes(Vec<u8>),
  Array(Vec<Reply>),
  Ok,
}

impl Reply {
  pub fn is_nil(&self) -> bool {
    matches!(self, Reply::Nil)
  }

  /// Reply as a UTF-8 string, if it carries one.
  pub fn as_text(&self) -> Option<&str> {
    match self {
      Reply::Text(s) => Some(s),
      Reply::Bytes(b) => std::str::from_utf8(b).ok(),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Reply::Int(n) => Some(*n),
      Reply::Text(s) => s.parse().ok(),
      _ => None,
    }
  }

  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      Reply::Bytes(b) => Some(b),
      Reply::Text(s) => Some(s.as_bytes()),
      _ => None,
    }
  }

  pub fn into_array(self) -> Vec<Reply> {
    match self {
      Reply::Array(items) => items,
      Reply::Nil => Vec::new(),
      other => vec![other],
    }
  }

  /// Flat field/value array (HGETALL, HSCAN pages) into ordered pairs.
  pub fn into_pairs(self) -> Vec<(String, Reply)> {
    let items = self.into_array();
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut it = items.into_iter();
    while let (Some(field), Some(value)) = (it.next(), it.next()) {
      let name = field.as_text().unwrap_or_default().to_string();
      out.push((name, value));
    }
    out
  }
}

/// Batch execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
  /// One grouped round trip, no atomicity.
  Pipeline,
  /// Atomic all-or-nothing group.
  Transaction,
}

/// Target of a cursor scan.
#[derive(Debug, Clone)]
pub enum ScanTarget {
  /// SCAN over the key space.
  Keys,
  /// HSCAN over one hash key (already routed).
  Hash(String),
}

/// Seam between the engine and a concrete cache store.
///
/// Two implementations ship: `RedisStore` (production) and `MemoryStore`
/// (embedded/tests). Keys inside `Command` are expected to be fully routed
/// before dispatch; the store never prefixes.
#[async_trait]
pub trait Store: Send + Sync {
  /// Dispatch one command.
  async fn dispatch(&self, cmd: Command) -> Result<Reply, EngineError>;

  /// Dispatch an ordered batch; results come back in submission order.
  /// Transaction mode fails as a whole if submission fails.
  async fn dispatch_batch(
    &self,
    cmds: Vec<Command>,
    mode: BatchMode,
  ) -> Result<Vec<Reply>, EngineError>;

  /// One scan page: (next cursor, items). Hash pages return a flattened
  /// field/value item list, matching the wire shape.
  async fn scan_page(
    &self,
    target: &ScanTarget,
    cursor: u64,
    pattern: Option<&str>,
    count: Option<usize>,
  ) -> Result<(u64, Vec<String>), EngineError>;

  /// SET key token NX PX ttl - the lock-acquire primitive.
  async fn set_nx_px(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, EngineError>;

  /// Delete the key only while it still holds `token`.
  async fn del_if_match(&self, key: &str, token: &str) -> Result<bool, EngineError>;

  /// Reset the key's expiry only while it still holds `token`.
  async fn pexpire_if_match(
    &self,
    key: &str,
    token: &str,
    ttl_ms: u64,
  ) -> Result<bool, EngineError>;
}
