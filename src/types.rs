//! Core types shared across the engine.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// One entity instance: field name to value.
pub type Record = serde_json::Map<String, Value>;

/// Primary-key value of an entity.
///
/// Serializes as a JSON number or string; as a map key it becomes the
/// object key string (`1` → `"1"`).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrimaryKey {
    Int(i64),
    Str(String),
}

impl PrimaryKey {
    /// Extract a key from a JSON value. Only integers and strings qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(PrimaryKey::Int),
            Value::String(s) => Some(PrimaryKey::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PrimaryKey::Int(i) => Value::from(*i),
            PrimaryKey::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Debug for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(i) => write!(f, "Key({})", i),
            PrimaryKey::Str(s) => write!(f, "Key({:?})", s),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(i) => write!(f, "{}", i),
            PrimaryKey::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(i: i64) -> Self {
        PrimaryKey::Int(i)
    }
}

impl From<&str> for PrimaryKey {
    fn from(s: &str) -> Self {
        PrimaryKey::Str(s.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(s: String) -> Self {
        PrimaryKey::Str(s)
    }
}

impl Serialize for PrimaryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PrimaryKey::Int(i) => serializer.serialize_i64(*i),
            PrimaryKey::Str(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for PrimaryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = PrimaryKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer or string primary key")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PrimaryKey, E> {
                Ok(PrimaryKey::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PrimaryKey, E> {
                i64::try_from(v)
                    .map(PrimaryKey::Int)
                    .map_err(|_| E::custom(format!("primary key {} out of range", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PrimaryKey, E> {
                Ok(PrimaryKey::Str(v.to_string()))
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

/// Notification that a row was inserted, updated or deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub key: PrimaryKey,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, key: impl Into<PrimaryKey>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

/// The identity a connection acts as.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct User {
    pub user_id: Option<i64>,
    pub auth_token: Option<String>,
}

impl User {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            auth_token: None,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}
