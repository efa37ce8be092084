//! Fixed-schema binary record codec.
//!
//! A record schema is an ordered field list. Packing projects an object
//! onto the schema (missing fields become null, extra fields are dropped)
//! and encodes the resulting value row with MessagePack, so a record costs
//! no per-field key bytes in the store.

use serde_json::Value;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackSchema {
  fields: Vec<String>,
}

impl PackSchema {
  pub fn new<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      fields: fields.into_iter().map(Into::into).collect(),
    }
  }

  pub fn fields(&self) -> &[String] {
    &self.fields
  }

  pub fn pack(&self, value: &Value) -> Result<Vec<u8>, EngineError> {
    match value {
      Value::Object(map) => {
        let row: Vec<&Value> = self
          .fields
          .iter()
          .map(|f| map.get(f).unwrap_or(&Value::Null))
          .collect();
        rmp_serde::to_vec(&row).map_err(|e| EngineError::Codec(e.to_string()))
      }
      // Non-record payloads pass through unprojected.
      other => rmp_serde::to_vec(other).map_err(|e| EngineError::Codec(e.to_string())),
    }
  }

  pub fn unpack(&self, bytes: &[u8]) -> Result<Value, EngineError> {
    let decoded: Value =
      rmp_serde::from_slice(bytes).map_err(|e| EngineError::Codec(e.to_string()))?;
    match decoded {
      Value::Array(items) if items.len() == self.fields.len() => {
        let mut out = serde_json::Map::with_capacity(items.len());
        for (field, item) in self.fields.iter().zip(items) {
          out.insert(field.clone(), item);
        }
        Ok(Value::Object(out))
      }
      other => Ok(other),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn projects_onto_schema() {
    let schema = PackSchema::new(["id", "name", "age"]);
    let packed = schema
      .pack(&json!({"name": "bob", "id": 3, "extra": "dropped"}))
      .unwrap();
    let out = schema.unpack(&packed).unwrap();
    assert_eq!(out, json!({"id": 3, "name": "bob", "age": null}));
  }

  #[test]
  fn non_record_passthrough() {
    let schema = PackSchema::new(["a", "b"]);
    let packed = schema.pack(&json!("scalar")).unwrap();
    assert_eq!(schema.unpack(&packed).unwrap(), json!("scalar"));
  }

  #[test]
  fn record_is_smaller_than_json() {
    let schema = PackSchema::new(["identifier", "display_name", "weight"]);
    let doc = json!({"identifier": 12, "display_name": "x", "weight": 1.5});
    let packed = schema.pack(&doc).unwrap();
    assert!(packed.len() < serde_json::to_vec(&doc).unwrap().len());
  }
}
