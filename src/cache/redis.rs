use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster_async::ClusterConnection;
use redis::{Script, Value};

use super::command::{Arg, BatchMode, Command, Reply, ScanTarget, Store};
use crate::error::EngineError;

// Conditional lock primitives, atomic on the store side.
const DEL_IF_MATCH: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
else
  return 0
end
"#;

const PEXPIRE_IF_MATCH: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("pexpire", KEYS[1], ARGV[2])
else
  return 0
end
"#;

enum Conn {
  Single(ConnectionManager),
  Cluster(ClusterConnection),
}

impl Clone for Conn {
  fn clone(&self) -> Self {
    match self {
      Conn::Single(c) => Conn::Single(c.clone()),
      Conn::Cluster(c) => Conn::Cluster(c.clone()),
    }
  }
}

/// Production `Store` backed by the `redis` crate, in single-node or
/// cluster mode.
pub struct RedisStore {
  conn: Conn,
}

impl RedisStore {
  /// Connect to a single node. The connection manager reconnects on
  /// transport errors by itself.
  pub async fn connect(url: &str) -> Result<Self, EngineError> {
    let client =
      redis::Client::open(url).map_err(|e| EngineError::ConnectionFatal(e.to_string()))?;
    let manager = ConnectionManager::new(client)
      .await
      .map_err(|e| EngineError::ConnectionFatal(e.to_string()))?;
    tracing::info!(url, "cache store connected");
    Ok(Self {
      conn: Conn::Single(manager),
    })
  }

  /// Connect in cluster mode. Routed keys carry their hash tag so
  /// multi-key commands stay within one slot.
  pub async fn connect_cluster(urls: Vec<String>) -> Result<Self, EngineError> {
    let client = redis::cluster::ClusterClient::new(urls)
      .map_err(|e| EngineError::ConnectionFatal(e.to_string()))?;
    let conn = client
      .get_async_connection()
      .await
      .map_err(|e| EngineError::ConnectionFatal(e.to_string()))?;
    tracing::info!("cache store cluster connected");
    Ok(Self {
      conn: Conn::Cluster(conn),
    })
  }

  fn build_cmd(cmd: &Command) -> redis::Cmd {
    let mut out = redis::cmd(&cmd.method);
    out.arg(&cmd.key);
    for a in &cmd.args {
      append_arg(&mut out, a);
    }
    out
  }

  async fn query(&self, cmd: redis::Cmd) -> Result<Value, EngineError> {
    let value = match self.conn.clone() {
      Conn::Single(mut c) => cmd.query_async(&mut c).await,
      Conn::Cluster(mut c) => cmd.query_async(&mut c).await,
    };
    value.map_err(|e| EngineError::Store(e.to_string()))
  }

  async fn invoke_script(
    &self,
    body: &str,
    key: &str,
    args: &[&str],
  ) -> Result<Value, EngineError> {
    let script = Script::new(body);
    let mut inv = script.prepare_invoke();
    inv.key(key);
    for a in args {
      inv.arg(*a);
    }
    let value = match self.conn.clone() {
      Conn::Single(mut c) => inv.invoke_async(&mut c).await,
      Conn::Cluster(mut c) => inv.invoke_async(&mut c).await,
    };
    value.map_err(|e| EngineError::Store(e.to_string()))
  }

  async fn run_pipeline<C: ConnectionLike>(
    pipe: &redis::Pipeline,
    conn: &mut C,
  ) -> Result<Vec<Value>, EngineError> {
    let values: Vec<Value> = pipe
      .query_async(conn)
      .await
      .map_err(|e| EngineError::Store(e.to_string()))?;
    Ok(values)
  }
}

fn append_arg(cmd: &mut redis::Cmd, a: &Arg) {
  match a {
    Arg::Str(s) => {
      cmd.arg(s);
    }
    Arg::Int(n) => {
      cmd.arg(*n);
    }
    Arg::Float(f) => {
      cmd.arg(*f);
    }
    Arg::Bytes(b) => {
      cmd.arg(&b[..]);
    }
  }
}

fn append_pipe_arg(cmd: &mut redis::Pipeline, a: &Arg) {
  match a {
    Arg::Str(s) => {
      cmd.arg(s);
    }
    Arg::Int(n) => {
      cmd.arg(*n);
    }
    Arg::Float(f) => {
      cmd.arg(*f);
    }
    Arg::Bytes(b) => {
      cmd.arg(&b[..]);
    }
  }
}

fn to_reply(value: Value) -> Reply {
  match value {
    Value::Nil => Reply::Nil,
    Value::Int(n) => Reply::Int(n),
    Value::BulkString(b) => match String::from_utf8(b) {
      Ok(s) => Reply::Text(s),
      Err(e) => Reply::Bytes(e.into_bytes()),
    },
    Value::SimpleString(s) => Reply::Text(s),
    Value::Okay => Reply::Ok,
    Value::Array(items) => Reply::Array(items.into_iter().map(to_reply).collect()),
    Value::Set(items) => Reply::Array(items.into_iter().map(to_reply).collect()),
    Value::Map(entries) => {
      let mut flat = Vec::with_capacity(entries.len() * 2);
      for (k, v) in entries {
        flat.push(to_reply(k));
        flat.push(to_reply(v));
      }
      Reply::Array(flat)
    }
    Value::Double(d) => Reply::Text(d.to_string()),
    Value::Boolean(b) => Reply::Int(b as i64),
    other => Reply::Text(format!("{:?}", other)),
  }
}

#[async_trait]
impl Store for RedisStore {
  async fn dispatch(&self, cmd: Command) -> Result<Reply, EngineError> {
    let built = Self::build_cmd(&cmd);
    Ok(to_reply(self.query(built).await?))
  }

  async fn dispatch_batch(
    &self,
    cmds: Vec<Command>,
    mode: BatchMode,
  ) -> Result<Vec<Reply>, EngineError> {
    let mut pipe = redis::pipe();
    if mode == BatchMode::Transaction {
      pipe.atomic();
    }
    for cmd in &cmds {
      pipe.cmd(&cmd.method).arg(&cmd.key);
      for a in &cmd.args {
        append_pipe_arg(&mut pipe, a);
      }
    }
    let values = match self.conn.clone() {
      Conn::Single(mut c) => Self::run_pipeline(&pipe, &mut c).await?,
      Conn::Cluster(mut c) => Self::run_pipeline(&pipe, &mut c).await?,
    };
    Ok(values.into_iter().map(to_reply).collect())
  }

  async fn scan_page(
    &self,
    target: &ScanTarget,
    cursor: u64,
    pattern: Option<&str>,
    count: Option<usize>,
  ) -> Result<(u64, Vec<String>), EngineError> {
    let mut cmd = match target {
      ScanTarget::Keys => {
        let mut c = redis::cmd("SCAN");
        c.arg(cursor);
        c
      }
      ScanTarget::Hash(key) => {
        let mut c = redis::cmd("HSCAN");
        c.arg(key).arg(cursor);
        c
      }
    };
    if let Some(ptn) = pattern {
      cmd.arg("MATCH").arg(ptn);
    }
    if let Some(n) = count {
      cmd.arg("COUNT").arg(n);
    }
    let value = self.query(cmd).await?;
    parse_scan_reply(value)
  }

  async fn set_nx_px(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, EngineError> {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(token).arg("NX").arg("PX").arg(ttl_ms);
    Ok(matches!(self.query(cmd).await?, Value::Okay))
  }

  async fn del_if_match(&self, key: &str, token: &str) -> Result<bool, EngineError> {
    let value = self.invoke_script(DEL_IF_MATCH, key, &[token]).await?;
    Ok(matches!(value, Value::Int(n) if n > 0))
  }

  async fn pexpire_if_match(
    &self,
    key: &str,
    token: &str,
    ttl_ms: u64,
  ) -> Result<bool, EngineError> {
    let ttl = ttl_ms.to_string();
    let value = self
      .invoke_script(PEXPIRE_IF_MATCH, key, &[token, &ttl])
      .await?;
    Ok(matches!(value, Value::Int(n) if n > 0))
  }
}

fn parse_scan_reply(value: Value) -> Result<(u64, Vec<String>), EngineError> {
  let mut items = match value {
    Value::Array(items) => items,
    other => {
      return Err(EngineError::Store(format!(
        "unexpected scan reply: {:?}",
        other
      )))
    }
  };
  if items.len() != 2 {
    return Err(EngineError::Store("malformed scan reply".into()));
  }
  let page = items.pop().unwrap_or(Value::Nil);
  let cursor = match to_reply(items.pop().unwrap_or(Value::Nil)).as_int() {
    Some(n) if n >= 0 => n as u64,
    _ => return Err(EngineError::Store("malformed scan cursor".into())),
  };
  let out = match to_reply(page) {
    Reply::Array(entries) => entries
      .into_iter()
      .filter_map(|r| r.as_text().map(|s| s.to_string()))
      .collect(),
    Reply::Nil => Vec::new(),
    _ => return Err(EngineError::Store("malformed scan page".into())),
  };
  Ok((cursor, out))
}
