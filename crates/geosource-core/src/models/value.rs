//! Dynamically-typed attribute values.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Canonical attribute type set every backend maps its native types onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FieldType {
    Integer,
    Float,
    #[default]
    Text,
    Boolean,
    DateTime,
    Bytes,
    Geometry,
}

impl FieldType {
    /// Canonical type for a SQL declared type name, following SQLite affinity rules
    /// extended with the names PostgreSQL and SQL Server report.
    pub fn from_sql_type(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "BOOLEAN" | "BOOL" | "BIT" => return FieldType::Boolean,
            "DATE" | "DATETIME" | "DATETIME2" | "SMALLDATETIME" | "TIMESTAMP"
            | "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" | "TIMESTAMP WITHOUT TIME ZONE"
            | "DATETIMEOFFSET" => return FieldType::DateTime,
            "GEOMETRY" | "GEOGRAPHY" | "POINT" | "LINESTRING" | "POLYGON" | "MULTIPOINT"
            | "MULTILINESTRING" | "MULTIPOLYGON" | "GEOMETRYCOLLECTION" => {
                return FieldType::Geometry
            }
            _ => {}
        }
        if base.contains("INT") {
            FieldType::Integer
        } else if base.contains("CHAR") || base.contains("CLOB") || base.contains("TEXT") {
            FieldType::Text
        } else if base.contains("BLOB") || base.contains("BINARY") || base == "BYTEA" {
            FieldType::Bytes
        } else if base.contains("REAL")
            || base.contains("FLOA")
            || base.contains("DOUB")
            || base.contains("NUMERIC")
            || base.contains("DECIMAL")
            || base.contains("MONEY")
        {
            FieldType::Float
        } else {
            FieldType::Text
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Text => "text",
            FieldType::Boolean => "boolean",
            FieldType::DateTime => "datetime",
            FieldType::Bytes => "bytes",
            FieldType::Geometry => "geometry",
        };
        f.write_str(name)
    }
}

/// Closed set of attribute value kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical type of this value, `None` for null
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(FieldType::Boolean),
            Value::Integer(_) => Some(FieldType::Integer),
            Value::Float(_) => Some(FieldType::Float),
            Value::Text(_) => Some(FieldType::Text),
            Value::DateTime(_) => Some(FieldType::DateTime),
            Value::Bytes(_) => Some(FieldType::Bytes),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Boolean(b) => Some(i64::from(*b)),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON scalar into a value; arrays and objects become their JSON text
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    /// Convert to a JSON value; bytes are rendered as lowercase hex
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => {
                serde_json::Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string())
            }
            Value::Bytes(b) => serde_json::Value::String(crate::codec::wkb::to_hex(b)),
        }
    }

    /// Total order used for sorting: nulls first, then numbers, booleans, text,
    /// timestamps and bytes. Numbers compare numerically across integer/float.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Integer(_) | Value::Float(_) => 1,
                Value::Boolean(_) => 2,
                Value::Text(_) => 3,
                Value::DateTime(_) => 4,
                Value::Bytes(_) => 5,
            }
        }
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
                let (a, b) = (self.as_f64().unwrap_or(0.0), other.as_f64().unwrap_or(0.0));
                a.total_cmp(&b)
            }
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_type_mapping() {
        assert_eq!(FieldType::from_sql_type("INTEGER"), FieldType::Integer);
        assert_eq!(FieldType::from_sql_type("bigint"), FieldType::Integer);
        assert_eq!(FieldType::from_sql_type("VARCHAR(80)"), FieldType::Text);
        assert_eq!(FieldType::from_sql_type("DOUBLE PRECISION"), FieldType::Float);
        assert_eq!(FieldType::from_sql_type("numeric(10,2)"), FieldType::Float);
        assert_eq!(FieldType::from_sql_type("BLOB"), FieldType::Bytes);
        assert_eq!(FieldType::from_sql_type("bytea"), FieldType::Bytes);
        assert_eq!(FieldType::from_sql_type("BOOLEAN"), FieldType::Boolean);
        assert_eq!(FieldType::from_sql_type("timestamptz"), FieldType::DateTime);
        assert_eq!(FieldType::from_sql_type("MULTIPOLYGON"), FieldType::Geometry);
    }

    #[test]
    fn test_sort_order_mixes_numbers() {
        assert_eq!(Value::Integer(2).sort_cmp(&Value::Float(1.5)), Ordering::Greater);
        assert_eq!(Value::Null.sort_cmp(&Value::Integer(0)), Ordering::Less);
        assert_eq!(Value::from("a").sort_cmp(&Value::from("b")), Ordering::Less);
    }

    #[test]
    fn test_json_conversion() {
        assert_eq!(Value::from_json(&serde_json::json!(3)), Value::Integer(3));
        assert_eq!(Value::from_json(&serde_json::json!(2.5)), Value::Float(2.5));
        assert_eq!(Value::from_json(&serde_json::json!("x")), Value::from("x"));
        assert_eq!(Value::Bytes(vec![0xAB, 0x01]).to_json(), serde_json::json!("ab01"));
    }
}
