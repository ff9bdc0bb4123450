//! Record keys and key-path access

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored record: an arbitrary field-to-value mapping.
pub type Record = serde_json::Map<String, Value>;

/// Primary key of a record. Integers order before strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Integer(i64),
    Text(String),
}

impl Key {
    /// Convert a JSON value into a key. Whole floats are accepted as integers.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Key::Integer).or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| Key::Integer(f as i64))
            }),
            Value::String(s) => Some(Key::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Integer(n) => Value::from(*n),
            Key::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Integer(n) => write!(f, "{}", n),
            Key::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Integer(n)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Integer(n.into())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

/// Look up a dotted key path (`"profile.id"`) inside a record.
pub fn value_at<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write `value` at a dotted key path, creating intermediate objects.
/// Returns false when a non-object value is in the way.
pub fn inject_at(record: &mut Record, path: &str, value: Value) -> bool {
    match path.split_once('.') {
        None => {
            record.insert(path.to_string(), value);
            true
        }
        Some((head, rest)) => {
            let child = record
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Record::new()));
            match child.as_object_mut() {
                Some(object) => inject_at(object, rest, value),
                None => false,
            }
        }
    }
}
