use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::command::{Arg, BatchMode, Command, Reply, ScanTarget, Store};
use crate::error::EngineError;

/// In-process `Store` implementing the command subset the engine uses.
///
/// Serves as the embedded/test counterpart of `RedisStore`, the same way a
/// second backend sits behind the relational trait. Single-threaded maps
/// behind a mutex; TTLs are enforced lazily on access.
#[derive(Default)]
pub struct MemoryStore {
  data: Mutex<HashMap<String, Entry>>,
}

#[derive(Clone)]
struct Entry {
  value: Kind,
  expires_at: Option<Instant>,
}

#[derive(Clone)]
enum Kind {
  Str(Vec<u8>),
  Hash(HashMap<String, Vec<u8>>),
  List(VecDeque<Vec<u8>>),
  Set(Vec<Vec<u8>>),
  Sorted(BTreeMap<String, f64>),
  Json(serde_json::Value),
}

fn arg_bytes(a: &Arg) -> Vec<u8> {
  match a {
    Arg::Str(s) => s.as_bytes().to_vec(),
    Arg::Int(n) => n.to_string().into_bytes(),
    Arg::Float(f) => f.to_string().into_bytes(),
    Arg::Bytes(b) => b.clone(),
  }
}

fn arg_text(a: &Arg) -> String {
  match a {
    Arg::Str(s) => s.clone(),
    Arg::Int(n) => n.to_string(),
    Arg::Float(f) => f.to_string(),
    Arg::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
  }
}

fn arg_f64(a: &Arg) -> Option<f64> {
  match a {
    Arg::Int(n) => Some(*n as f64),
    Arg::Float(f) => Some(*f),
    Arg::Str(s) => s.parse().ok(),
    Arg::Bytes(b) => std::str::from_utf8(b).ok()?.parse().ok(),
  }
}

fn arg_i64(a: &Arg) -> Option<i64> {
  match a {
    Arg::Int(n) => Some(*n),
    Arg::Float(f) => Some(*f as i64),
    Arg::Str(s) => s.parse().ok(),
    Arg::Bytes(b) => std::str::from_utf8(b).ok()?.parse().ok(),
  }
}

fn bytes_reply(b: Vec<u8>) -> Reply {
  match String::from_utf8(b) {
    Ok(s) => Reply::Text(s),
    Err(e) => Reply::Bytes(e.into_bytes()),
  }
}

/// Glob match supporting `*` only, which is all the engine's patterns use.
fn glob_match(pattern: &str, s: &str) -> bool {
  let parts: Vec<&str> = pattern.split('*').collect();
  if parts.len() == 1 {
    return pattern == s;
  }
  let mut rest = s;
  for (i, part) in parts.iter().enumerate() {
    if part.is_empty() {
      continue;
    }
    if i == 0 {
      match rest.strip_prefix(part) {
        Some(r) => rest = r,
        None => return false,
      }
    } else if i == parts.len() - 1 {
      return rest.ends_with(part);
    } else {
      match rest.find(part) {
        Some(pos) => rest = &rest[pos + part.len()..],
        None => return false,
      }
    }
  }
  // Pattern ends with '*'
  parts.last().map(|p| p.is_empty()).unwrap_or(false) || rest.is_empty()
}

fn rank_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
  let n = len as i64;
  let mut a = if start < 0 { n + start } else { start };
  let mut b = if stop < 0 { n + stop } else { stop };
  if a < 0 {
    a = 0;
  }
  if b >= n {
    b = n - 1;
  }
  if a > b || n == 0 {
    return None;
  }
  Some((a as usize, b as usize))
}

const SUPPORTED: &[&str] = &[
  "get", "set", "del", "exists", "expire", "pexpire", "ttl", "pttl", "rename", "hget", "hset",
  "hdel", "hgetall", "hmget", "lpush", "rpush", "lrange", "llen", "sadd", "srem", "smembers",
  "sismember", "spop", "scard", "zadd", "zrange", "zcard", "zmscore", "zpopmin", "publish",
  "json.get", "json.set",
];

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn live<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let expired = match data.get(key) {
      Some(e) => e.expires_at.map(|t| t <= Instant::now()).unwrap_or(false),
      None => return None,
    };
    if expired {
      data.remove(key);
      return None;
    }
    data.get_mut(key)
  }

  fn apply(data: &mut HashMap<String, Entry>, cmd: &Command) -> Result<Reply, EngineError> {
    let method = cmd.method.to_ascii_lowercase();
    let key = cmd.key.clone();
    match method.as_str() {
      "get" => Ok(match Self::live(data, &key) {
        Some(Entry {
          value: Kind::Str(b),
          ..
        }) => bytes_reply(b.clone()),
        _ => Reply::Nil,
      }),
      "set" => {
        let Some(value) = cmd.args.first() else {
          return Err(EngineError::Store("SET needs a value".into()));
        };
        let mut ttl: Option<Duration> = None;
        let mut keep_ttl = false;
        let mut nx = false;
        let mut i = 1;
        while i < cmd.args.len() {
          match arg_text(&cmd.args[i]).to_ascii_uppercase().as_str() {
            "EX" => {
              let secs = cmd.args.get(i + 1).and_then(arg_i64).unwrap_or(0);
              ttl = Some(Duration::from_secs(secs.max(0) as u64));
              i += 2;
            }
            "PX" => {
              let ms = cmd.args.get(i + 1).and_then(arg_i64).unwrap_or(0);
              ttl = Some(Duration::from_millis(ms.max(0) as u64));
              i += 2;
            }
            "KEEPTTL" => {
              keep_ttl = true;
              i += 1;
            }
            "NX" => {
              nx = true;
              i += 1;
            }
            other => {
              return Err(EngineError::Store(format!("SET option {}", other)));
            }
          }
        }
        if nx && Self::live(data, &key).is_some() {
          return Ok(Reply::Nil);
        }
        let prior_expiry = data.get(&key).and_then(|e| e.expires_at);
        let expires_at = match (ttl, keep_ttl) {
          (Some(d), _) => Some(Instant::now() + d),
          (None, true) => prior_expiry,
          (None, false) => None,
        };
        data.insert(
          key,
          Entry {
            value: Kind::Str(arg_bytes(value)),
            expires_at,
          },
        );
        Ok(Reply::Ok)
      }
      "del" => {
        let mut n = 0;
        if data.remove(&key).is_some() {
          n += 1;
        }
        for a in &cmd.args {
          if data.remove(&arg_text(a)).is_some() {
            n += 1;
          }
        }
        Ok(Reply::Int(n))
      }
      "exists" => Ok(Reply::Int(Self::live(data, &key).is_some() as i64)),
      "expire" | "pexpire" => {
        let amount = cmd.args.first().and_then(arg_i64).unwrap_or(0).max(0) as u64;
        let d = if method == "expire" {
          Duration::from_secs(amount)
        } else {
          Duration::from_millis(amount)
        };
        match Self::live(data, &key) {
          Some(e) => {
            e.expires_at = Some(Instant::now() + d);
            Ok(Reply::Int(1))
          }
          None => Ok(Reply::Int(0)),
        }
      }
      "ttl" | "pttl" => match Self::live(data, &key) {
        Some(e) => match e.expires_at {
          Some(t) => {
            let left = t.saturating_duration_since(Instant::now());
            Ok(Reply::Int(if method == "ttl" {
              left.as_secs() as i64
            } else {
              left.as_millis() as i64
            }))
          }
          None => Ok(Reply::Int(-1)),
        },
        None => Ok(Reply::Int(-2)),
      },
      "rename" => {
        let Some(target) = cmd.args.first().map(arg_text) else {
          return Err(EngineError::Store("RENAME needs a target".into()));
        };
        match data.remove(&key) {
          Some(e) => {
            data.insert(target, e);
            Ok(Reply::Ok)
          }
          None => Err(EngineError::Store("no such key".into())),
        }
      }
      "hget" => {
        let field = cmd.args.first().map(arg_text).unwrap_or_default();
        Ok(match Self::live(data, &key) {
          Some(Entry {
            value: Kind::Hash(h),
            ..
          }) => h.get(&field).map(|v| bytes_reply(v.clone())).unwrap_or(Reply::Nil),
          _ => Reply::Nil,
        })
      }
      "hset" => {
        let entry = data.entry(key).or_insert(Entry {
          value: Kind::Hash(HashMap::new()),
          expires_at: None,
        });
        let Kind::Hash(h) = &mut entry.value else {
          return Err(EngineError::Store("wrong type for HSET".into()));
        };
        let mut added = 0;
        let mut it = cmd.args.chunks(2);
        for pair in &mut it {
          if pair.len() < 2 {
            return Err(EngineError::Store("HSET needs field/value pairs".into()));
          }
          if h.insert(arg_text(&pair[0]), arg_bytes(&pair[1])).is_none() {
            added += 1;
          }
        }
        Ok(Reply::Int(added))
      }
      "hdel" => {
        let mut n = 0;
        if let Some(Entry {
          value: Kind::Hash(h),
          ..
        }) = Self::live(data, &key)
        {
          for a in &cmd.args {
            if h.remove(&arg_text(a)).is_some() {
              n += 1;
            }
          }
        }
        Ok(Reply::Int(n))
      }
      "hgetall" => Ok(match Self::live(data, &key) {
        Some(Entry {
          value: Kind::Hash(h),
          ..
        }) => {
          let mut flat = Vec::with_capacity(h.len() * 2);
          for (f, v) in h.iter() {
            flat.push(Reply::Text(f.clone()));
            flat.push(bytes_reply(v.clone()));
          }
          Reply::Array(flat)
        }
        _ => Reply::Array(Vec::new()),
      }),
      "hmget" => Ok(match Self::live(data, &key) {
        Some(Entry {
          value: Kind::Hash(h),
          ..
        }) => Reply::Array(
          cmd
            .args
            .iter()
            .map(|a| {
              h.get(&arg_text(a))
                .map(|v| bytes_reply(v.clone()))
                .unwrap_or(Reply::Nil)
            })
            .collect(),
        ),
        _ => Reply::Array(cmd.args.iter().map(|_| Reply::Nil).collect()),
      }),
      "lpush" | "rpush" => {
        let entry = data.entry(key).or_insert(Entry {
          value: Kind::List(VecDeque::new()),
          expires_at: None,
        });
        let Kind::List(l) = &mut entry.value else {
          return Err(EngineError::Store("wrong type for push".into()));
        };
        for a in &cmd.args {
          if method == "lpush" {
            l.push_front(arg_bytes(a));
          } else {
            l.push_back(arg_bytes(a));
          }
        }
        Ok(Reply::Int(l.len() as i64))
      }
      "lrange" => {
        let start = cmd.args.first().and_then(arg_i64).unwrap_or(0);
        let stop = cmd.args.get(1).and_then(arg_i64).unwrap_or(-1);
        Ok(match Self::live(data, &key) {
          Some(Entry {
            value: Kind::List(l),
            ..
          }) => match rank_range(start, stop, l.len()) {
            Some((a, b)) => Reply::Array(
              l.iter()
                .skip(a)
                .take(b - a + 1)
                .map(|v| bytes_reply(v.clone()))
                .collect(),
            ),
            None => Reply::Array(Vec::new()),
          },
          _ => Reply::Array(Vec::new()),
        })
      }
      "llen" => Ok(match Self::live(data, &key) {
        Some(Entry {
          value: Kind::List(l),
          ..
        }) => Reply::Int(l.len() as i64),
        _ => Reply::Int(0),
      }),
      "sadd" => {
        let entry = data.entry(key).or_insert(Entry {
          value: Kind::Set(Vec::new()),
          expires_at: None,
        });
        let Kind::Set(s) = &mut entry.value else {
          return Err(EngineError::Store("wrong type for SADD".into()));
        };
        let mut n = 0;
        for a in &cmd.args {
          let m = arg_bytes(a);
          if !s.contains(&m) {
            s.push(m);
            n += 1;
          }
        }
        Ok(Reply::Int(n))
      }
      "srem" => {
        let mut n = 0;
        if let Some(Entry {
          value: Kind::Set(s),
          ..
        }) = Self::live(data, &key)
        {
          for a in &cmd.args {
            let m = arg_bytes(a);
            if let Some(pos) = s.iter().position(|x| *x == m) {
              s.remove(pos);
              n += 1;
            }
          }
        }
        Ok(Reply::Int(n))
      }
      "smembers" => Ok(match Self::live(data, &key) {
        Some(Entry {
          value: Kind::Set(s),
          ..
        }) => Reply::Array(s.iter().map(|v| bytes_reply(v.clone())).collect()),
        _ => Reply::Array(Vec::new()),
      }),
      "sismember" => {
        let m = cmd.args.first().map(arg_bytes).unwrap_or_default();
        Ok(match Self::live(data, &key) {
          Some(Entry {
            value: Kind::Set(s),
            ..
          }) => Reply::Int(s.contains(&m) as i64),
          _ => Reply::Int(0),
        })
      }
      "scard" => Ok(match Self::live(data, &key) {
        Some(Entry {
          value: Kind::Set(s),
          ..
        }) => Reply::Int(s.len() as i64),
        _ => Reply::Int(0),
      }),
      "spop" => {
        let count = cmd.args.first().and_then(arg_i64).unwrap_or(1).max(0) as usize;
        let mut popped = Vec::new();
        if let Some(Entry {
          value: Kind::Set(s),
          ..
        }) = Self::live(data, &key)
        {
          for _ in 0..count.min(s.len()) {
            popped.push(bytes_reply(s.remove(0)));
          }
        }
        Ok(Reply::Array(popped))
      }
      "zadd" => {
        let entry = data.entry(key).or_insert(Entry {
          value: Kind::Sorted(BTreeMap::new()),
          expires_at: None,
        });
        let Kind::Sorted(z) = &mut entry.value else {
          return Err(EngineError::Store("wrong type for ZADD".into()));
        };
        let mut n = 0;
        let mut it = cmd.args.chunks(2);
        for pair in &mut it {
          if pair.len() < 2 {
            return Err(EngineError::Store("ZADD needs score/member pairs".into()));
          }
          let Some(score) = arg_f64(&pair[0]) else {
            return Err(EngineError::Store("ZADD score not a number".into()));
          };
          if z.insert(arg_text(&pair[1]), score).is_none() {
            n += 1;
          }
        }
        Ok(Reply::Int(n))
      }
      "zcard" => Ok(match Self::live(data, &key) {
        Some(Entry {
          value: Kind::Sorted(z),
          ..
        }) => Reply::Int(z.len() as i64),
        _ => Reply::Int(0),
      }),
      "zrange" => {
        let start = cmd.args.first().and_then(arg_i64).unwrap_or(0);
        let stop = cmd.args.get(1).and_then(arg_i64).unwrap_or(-1);
        let with_scores = cmd
          .args
          .get(2)
          .map(|a| arg_text(a).eq_ignore_ascii_case("WITHSCORES"))
          .unwrap_or(false);
        Ok(match Self::live(data, &key) {
          Some(Entry {
            value: Kind::Sorted(z),
            ..
          }) => {
            let mut members: Vec<(&String, &f64)> = z.iter().collect();
            members.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap().then(a.0.cmp(b.0)));
            match rank_range(start, stop, members.len()) {
              Some((a, b)) => {
                let mut out = Vec::new();
                for (m, s) in &members[a..=b] {
                  out.push(Reply::Text((*m).clone()));
                  if with_scores {
                    out.push(Reply::Text(s.to_string()));
                  }
                }
                Reply::Array(out)
              }
              None => Reply::Array(Vec::new()),
            }
          }
          _ => Reply::Array(Vec::new()),
        })
      }
      "zmscore" => Ok(match Self::live(data, &key) {
        Some(Entry {
          value: Kind::Sorted(z),
          ..
        }) => Reply::Array(
          cmd
            .args
            .iter()
            .map(|a| {
              z.get(&arg_text(a))
                .map(|s| Reply::Text(s.to_string()))
                .unwrap_or(Reply::Nil)
            })
            .collect(),
        ),
        _ => Reply::Array(cmd.args.iter().map(|_| Reply::Nil).collect()),
      }),
      "zpopmin" => {
        let count = cmd.args.first().and_then(arg_i64).unwrap_or(1).max(0) as usize;
        let mut out = Vec::new();
        if let Some(Entry {
          value: Kind::Sorted(z),
          ..
        }) = Self::live(data, &key)
        {
          let mut members: Vec<(String, f64)> =
            z.iter().map(|(m, s)| (m.clone(), *s)).collect();
          members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(a.0.cmp(&b.0)));
          for (m, s) in members.into_iter().take(count) {
            z.remove(&m);
            out.push(Reply::Text(m));
            out.push(Reply::Text(s.to_string()));
          }
        }
        Ok(Reply::Array(out))
      }
      "publish" => Ok(Reply::Int(0)),
      "json.set" => {
        let path = cmd.args.first().map(arg_text).unwrap_or_else(|| "$".into());
        let raw = cmd.args.get(1).map(arg_text).unwrap_or_default();
        let value: serde_json::Value = serde_json::from_str(&raw)
          .map_err(|e| EngineError::Store(format!("JSON.SET payload: {}", e)))?;
        if path == "$" {
          data.insert(
            key,
            Entry {
              value: Kind::Json(value),
              expires_at: None,
            },
          );
          return Ok(Reply::Ok);
        }
        let Some(Entry {
          value: Kind::Json(doc),
          ..
        }) = Self::live(data, &key)
        else {
          return Err(EngineError::Store("JSON.SET path on missing key".into()));
        };
        let mut node = doc;
        let segments: Vec<&str> = path.trim_start_matches("$.").split('.').collect();
        let last = segments.len() - 1;
        for (i, seg) in segments.iter().enumerate() {
          // Move the reference forward each step instead of reborrowing.
          let cur = node;
          let obj = cur
            .as_object_mut()
            .ok_or_else(|| EngineError::Store("JSON.SET path into non-object".into()))?;
          if i == last {
            obj.insert((*seg).to_string(), value.clone());
            break;
          }
          node = obj
            .entry((*seg).to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        }
        Ok(Reply::Ok)
      }
      "json.get" => {
        let path = cmd.args.first().map(arg_text).unwrap_or_else(|| "$".into());
        let Some(Entry {
          value: Kind::Json(doc),
          ..
        }) = Self::live(data, &key)
        else {
          return Ok(Reply::Nil);
        };
        let matches: Vec<&serde_json::Value> = if path == "$" {
          vec![doc]
        } else {
          let mut node = Some(&*doc);
          for seg in path.trim_start_matches("$.").split('.') {
            node = node.and_then(|n| n.get(seg));
          }
          node.into_iter().collect()
        };
        let text = serde_json::to_string(&matches)
          .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(Reply::Text(text))
      }
      other => Err(EngineError::UnsupportedCommand(other.to_string())),
    }
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn dispatch(&self, cmd: Command) -> Result<Reply, EngineError> {
    let mut data = self.data.lock();
    Self::apply(&mut data, &cmd)
  }

  async fn dispatch_batch(
    &self,
    cmds: Vec<Command>,
    mode: BatchMode,
  ) -> Result<Vec<Reply>, EngineError> {
    let mut data = self.data.lock();
    match mode {
      BatchMode::Pipeline => {
        // No atomicity: effects of earlier commands survive a later failure.
        let mut out = Vec::with_capacity(cmds.len());
        for cmd in &cmds {
          out.push(Self::apply(&mut data, cmd)?);
        }
        Ok(out)
      }
      BatchMode::Transaction => {
        for cmd in &cmds {
          if !SUPPORTED.contains(&cmd.method.to_ascii_lowercase().as_str()) {
            return Err(EngineError::UnsupportedCommand(cmd.method.clone()));
          }
        }
        // All-or-nothing: apply against a copy, swap on success.
        let mut staged = data.clone();
        let mut out = Vec::with_capacity(cmds.len());
        for cmd in &cmds {
          out.push(Self::apply(&mut staged, cmd)?);
        }
        *data = staged;
        Ok(out)
      }
    }
  }

  async fn scan_page(
    &self,
    target: &ScanTarget,
    cursor: u64,
    pattern: Option<&str>,
    count: Option<usize>,
  ) -> Result<(u64, Vec<String>), EngineError> {
    let mut data = self.data.lock();
    let page = count.unwrap_or(10);
    match target {
      ScanTarget::Keys => {
        let mut keys: Vec<String> = data
          .keys()
          .filter(|k| pattern.map(|p| glob_match(p, k)).unwrap_or(true))
          .cloned()
          .collect();
        keys.sort();
        let start = cursor as usize;
        let end = (start + page).min(keys.len());
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, keys[start.min(keys.len())..end].to_vec()))
      }
      ScanTarget::Hash(key) => {
        let mut items: Vec<(String, String)> = match Self::live(&mut data, key) {
          Some(Entry {
            value: Kind::Hash(h),
            ..
          }) => h
            .iter()
            .filter(|(f, _)| pattern.map(|p| glob_match(p, f)).unwrap_or(true))
            .map(|(f, v)| (f.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect(),
          _ => Vec::new(),
        };
        items.sort();
        let start = cursor as usize;
        let end = (start + page).min(items.len());
        let next = if end >= items.len() { 0 } else { end as u64 };
        let mut flat = Vec::with_capacity((end - start.min(end)) * 2);
        for (f, v) in &items[start.min(items.len())..end] {
          flat.push(f.clone());
          flat.push(v.clone());
        }
        Ok((next, flat))
      }
    }
  }

  async fn set_nx_px(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, EngineError> {
    let mut data = self.data.lock();
    if Self::live(&mut data, key).is_some() {
      return Ok(false);
    }
    data.insert(
      key.to_string(),
      Entry {
        value: Kind::Str(token.as_bytes().to_vec()),
        expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
      },
    );
    Ok(true)
  }

  async fn del_if_match(&self, key: &str, token: &str) -> Result<bool, EngineError> {
    let mut data = self.data.lock();
    let held = matches!(
      Self::live(&mut data, key),
      Some(Entry { value: Kind::Str(b), .. }) if b == token.as_bytes()
    );
    if held {
      data.remove(key);
    }
    Ok(held)
  }

  async fn pexpire_if_match(
    &self,
    key: &str,
    token: &str,
    ttl_ms: u64,
  ) -> Result<bool, EngineError> {
    let mut data = self.data.lock();
    match Self::live(&mut data, key) {
      Some(e) => {
        let held = matches!(&e.value, Kind::Str(b) if b == token.as_bytes());
        if held {
          e.expires_at = Some(Instant::now() + Duration::from_millis(ttl_ms));
        }
        Ok(held)
      }
      None => Ok(false),
    }
  }
}
