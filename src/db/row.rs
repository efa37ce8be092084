use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use postgres_types::{to_sql_checked, IsNull, ToSql, Type};
use serde_json::{json, Map, Value};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::error::EngineError;

/// Positional SQL argument. One typed variant per supported binding;
/// integers and floats narrow to the column's width at bind time.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Text(String),
  Json(Value),
  Uuid(Uuid),
  Timestamp(DateTime<Utc>),
  Bytes(Vec<u8>),
}

impl From<&str> for SqlParam {
  fn from(v: &str) -> Self {
    SqlParam::Text(v.to_string())
  }
}

impl From<String> for SqlParam {
  fn from(v: String) -> Self {
    SqlParam::Text(v)
  }
}

impl From<i64> for SqlParam {
  fn from(v: i64) -> Self {
    SqlParam::Int(v)
  }
}

impl From<i32> for SqlParam {
  fn from(v: i32) -> Self {
    SqlParam::Int(v as i64)
  }
}

impl From<f64> for SqlParam {
  fn from(v: f64) -> Self {
    SqlParam::Float(v)
  }
}

impl From<bool> for SqlParam {
  fn from(v: bool) -> Self {
    SqlParam::Bool(v)
  }
}

impl From<Value> for SqlParam {
  fn from(v: Value) -> Self {
    SqlParam::Json(v)
  }
}

impl From<Option<String>> for SqlParam {
  fn from(v: Option<String>) -> Self {
    v.map(SqlParam::Text).unwrap_or(SqlParam::Null)
  }
}

impl ToSql for SqlParam {
  fn to_sql(
    &self,
    ty: &Type,
    out: &mut bytes::BytesMut,
  ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
    match self {
      SqlParam::Null => Ok(IsNull::Yes),
      SqlParam::Bool(v) => v.to_sql(ty, out),
      SqlParam::Int(v) => match *ty {
        Type::INT2 => (*v as i16).to_sql(ty, out),
        Type::INT4 => (*v as i32).to_sql(ty, out),
        _ => v.to_sql(ty, out),
      },
      SqlParam::Float(v) => match *ty {
        Type::FLOAT4 => (*v as f32).to_sql(ty, out),
        _ => v.to_sql(ty, out),
      },
      SqlParam::Text(v) => v.to_sql(ty, out),
      SqlParam::Json(v) => v.to_sql(ty, out),
      SqlParam::Uuid(v) => v.to_sql(ty, out),
      SqlParam::Timestamp(v) => v.to_sql(ty, out),
      SqlParam::Bytes(v) => v.to_sql(ty, out),
    }
  }

  fn accepts(_ty: &Type) -> bool {
    true
  }

  to_sql_checked!();
}

/// Borrow a parameter slice in the shape the driver wants.
pub fn bind_params(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
  params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Convert one row into a JSON object keyed by column name.
pub fn row_to_json(row: &Row) -> Result<Value, EngineError> {
  let mut map = Map::with_capacity(row.columns().len());
  for (i, col) in row.columns().iter().enumerate() {
    map.insert(col.name().to_string(), column_value(row, i, col.type_())?);
  }
  Ok(Value::Object(map))
}

fn column_value(row: &Row, i: usize, ty: &Type) -> Result<Value, EngineError> {
  let codec = |e: tokio_postgres::Error| EngineError::Codec(e.to_string());
  let value = match *ty {
    Type::BOOL => row.try_get::<_, Option<bool>>(i).map_err(codec)?.map(Value::Bool),
    Type::INT2 => row
      .try_get::<_, Option<i16>>(i)
      .map_err(codec)?
      .map(|v| json!(v)),
    Type::INT4 => row
      .try_get::<_, Option<i32>>(i)
      .map_err(codec)?
      .map(|v| json!(v)),
    Type::INT8 => row
      .try_get::<_, Option<i64>>(i)
      .map_err(codec)?
      .map(|v| json!(v)),
    Type::FLOAT4 => row
      .try_get::<_, Option<f32>>(i)
      .map_err(codec)?
      .map(|v| json!(v)),
    Type::FLOAT8 => row
      .try_get::<_, Option<f64>>(i)
      .map_err(codec)?
      .map(|v| json!(v)),
    Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(i).map_err(codec)?,
    Type::UUID => row
      .try_get::<_, Option<Uuid>>(i)
      .map_err(codec)?
      .map(|v| Value::String(v.to_string())),
    Type::TIMESTAMPTZ => row
      .try_get::<_, Option<DateTime<Utc>>>(i)
      .map_err(codec)?
      .map(|v| Value::String(v.to_rfc3339())),
    Type::TIMESTAMP => row
      .try_get::<_, Option<NaiveDateTime>>(i)
      .map_err(codec)?
      .map(|v| Value::String(v.to_string())),
    Type::DATE => row
      .try_get::<_, Option<NaiveDate>>(i)
      .map_err(codec)?
      .map(|v| Value::String(v.to_string())),
    Type::BYTEA => row
      .try_get::<_, Option<Vec<u8>>>(i)
      .map_err(codec)?
      .map(|v| {
        Value::String(v.iter().map(|b| format!("{:02x}", b)).collect::<String>())
      }),
    _ => row
      .try_get::<_, Option<String>>(i)
      .unwrap_or(None)
      .map(Value::String),
  };
  Ok(value.unwrap_or(Value::Null))
}
