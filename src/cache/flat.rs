//! Cycle-safe JSON codec.
//!
//! Encodes a document as an ordered node table: objects, arrays, and
//! strings become table entries, and any reference to one of them inside a
//! container is written as its index in string form. Numbers, booleans, and
//! null stay inline. Node 0 is the root. Shared nodes are written once and
//! referenced by index; decode rebuilds by index and rejects truly cyclic
//! tables (a `serde_json::Value` tree cannot hold a cycle).

use std::collections::HashMap;

use serde_json::Value;

use crate::error::EngineError;

pub fn encode(value: &Value) -> Result<String, EngineError> {
  let mut nodes: Vec<Value> = Vec::new();
  let mut strings: HashMap<String, usize> = HashMap::new();
  index_of(value, &mut nodes, &mut strings);
  serde_json::to_string(&nodes).map_err(|e| EngineError::Codec(e.to_string()))
}

pub fn decode(text: &str) -> Result<Value, EngineError> {
  let nodes: Vec<Value> =
    serde_json::from_str(text).map_err(|e| EngineError::Codec(e.to_string()))?;
  if nodes.is_empty() {
    return Err(EngineError::Codec("empty node table".into()));
  }
  let mut visiting = Vec::new();
  resolve(0, &nodes, &mut visiting)
}

fn index_of(v: &Value, nodes: &mut Vec<Value>, strings: &mut HashMap<String, usize>) -> usize {
  match v {
    Value::String(s) => {
      if let Some(i) = strings.get(s) {
        return *i;
      }
      let idx = nodes.len();
      nodes.push(Value::String(s.clone()));
      strings.insert(s.clone(), idx);
      idx
    }
    Value::Array(items) => {
      let idx = nodes.len();
      nodes.push(Value::Null);
      let out: Vec<Value> = items.iter().map(|it| child(it, nodes, strings)).collect();
      nodes[idx] = Value::Array(out);
      idx
    }
    Value::Object(map) => {
      let idx = nodes.len();
      nodes.push(Value::Null);
      let mut out = serde_json::Map::with_capacity(map.len());
      for (k, val) in map {
        out.insert(k.clone(), child(val, nodes, strings));
      }
      nodes[idx] = Value::Object(out);
      idx
    }
    // Primitive root: stored directly as node 0.
    other => {
      let idx = nodes.len();
      nodes.push(other.clone());
      idx
    }
  }
}

fn child(v: &Value, nodes: &mut Vec<Value>, strings: &mut HashMap<String, usize>) -> Value {
  match v {
    Value::String(_) | Value::Array(_) | Value::Object(_) => {
      Value::String(index_of(v, nodes, strings).to_string())
    }
    other => other.clone(),
  }
}

fn resolve(idx: usize, nodes: &[Value], visiting: &mut Vec<usize>) -> Result<Value, EngineError> {
  if visiting.contains(&idx) {
    return Err(EngineError::Codec("cyclic reference".into()));
  }
  let node = nodes
    .get(idx)
    .ok_or_else(|| EngineError::Codec(format!("dangling reference {}", idx)))?;
  match node {
    Value::Array(items) => {
      visiting.push(idx);
      let mut out = Vec::with_capacity(items.len());
      for it in items {
        out.push(resolve_child(it, nodes, visiting)?);
      }
      visiting.pop();
      Ok(Value::Array(out))
    }
    Value::Object(map) => {
      visiting.push(idx);
      let mut out = serde_json::Map::with_capacity(map.len());
      for (k, v) in map {
        out.insert(k.clone(), resolve_child(v, nodes, visiting)?);
      }
      visiting.pop();
      Ok(Value::Object(out))
    }
    other => Ok(other.clone()),
  }
}

fn resolve_child(
  v: &Value,
  nodes: &[Value],
  visiting: &mut Vec<usize>,
) -> Result<Value, EngineError> {
  match v {
    // Inside a container every string is a node reference.
    Value::String(s) => {
      let idx: usize = s
        .parse()
        .map_err(|_| EngineError::Codec(format!("malformed reference {:?}", s)))?;
      resolve(idx, nodes, visiting)
    }
    other => Ok(other.clone()),
  }
}
