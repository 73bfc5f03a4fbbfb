//! Backend-neutral table definitions used to bootstrap storage.

use crate::types::Record;
use serde_json::{Number, Value};

/// Column storage class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    /// Auto-assigned integer primary key.
    Serial,
    Integer,
    Real,
    Text,
}

impl ColumnType {
    /// Convert a client value to what a column of this type stores, following
    /// SQLite affinity: booleans become 0/1, nested values become JSON text,
    /// numeric text becomes a number in numeric columns and numbers become
    /// text in text columns.
    pub fn coerce(self, value: &Value) -> Value {
        let value = match value {
            Value::Bool(b) => Value::from(i64::from(*b)),
            Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
            other => other.clone(),
        };

        match (self, value) {
            (ColumnType::Serial | ColumnType::Integer, Value::String(s)) => {
                match parse_number(&s) {
                    Some(n) => integral(&n),
                    None => Value::String(s),
                }
            }
            (ColumnType::Serial | ColumnType::Integer, Value::Number(n)) => integral(&n),
            (ColumnType::Real, Value::String(s)) => match parse_number(&s) {
                Some(n) => real(&n),
                None => Value::String(s),
            },
            (ColumnType::Real, Value::Number(n)) => real(&n),
            (ColumnType::Text, Value::Number(n)) => Value::String(n.to_string()),
            (_, value) => value,
        }
    }
}

fn parse_number(text: &str) -> Option<Number> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Number::from(i));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
}

/// Whole floats collapse to integers.
fn integral(n: &Number) -> Value {
    if n.is_i64() || n.is_u64() {
        return Value::Number(n.clone());
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Value::from(f as i64)
        }
        _ => Value::Number(n.clone()),
    }
}

fn real(n: &Number) -> Value {
    n.as_f64()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

/// A table definition plus seed rows, in client field names.
#[derive(Clone, Debug, Default)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Record>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn column(mut self, name: impl Into<String>, kind: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            kind,
        });
        self
    }

    /// Add a seed row. Non-object values are ignored.
    pub fn row(mut self, row: Value) -> Self {
        if let Value::Object(map) = row {
            self.rows.push(map);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_columns_parse_text() {
        assert_eq!(ColumnType::Serial.coerce(&json!("1")), json!(1));
        assert_eq!(ColumnType::Integer.coerce(&json!("3.0")), json!(3));
        assert_eq!(ColumnType::Integer.coerce(&json!("2.5")), json!(2.5));
        assert_eq!(ColumnType::Integer.coerce(&json!("abc")), json!("abc"));
        assert_eq!(ColumnType::Real.coerce(&json!(2)), json!(2.0));
    }

    #[test]
    fn test_text_and_booleans() {
        assert_eq!(ColumnType::Text.coerce(&json!(7)), json!("7"));
        assert_eq!(ColumnType::Text.coerce(&json!(true)), json!("1"));
        assert_eq!(ColumnType::Integer.coerce(&json!(false)), json!(0));
        assert_eq!(ColumnType::Text.coerce(&json!([1, 2])), json!("[1,2]"));
        assert_eq!(ColumnType::Integer.coerce(&Value::Null), Value::Null);
    }
}
