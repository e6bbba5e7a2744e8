//! Schema-less records returned by backends.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute map copied onto graph nodes and edges
pub type Attributes = Map<String, Value>;

/// One raw backend row/document: an ordered `key → value` association.
///
/// Lookups accept dotted paths (`geo.country`) that descend into nested
/// objects. A literal key containing dots wins over the nested path.
/// `null` values are treated as absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Non-null value at `path`
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.0.get(path).filter(|v| !v.is_null()) {
            return Some(value);
        }
        if !path.contains('.') {
            return None;
        }

        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        (!current.is_null()).then_some(current)
    }

    /// Copies the present values of `keys` into a new attribute map, keyed
    /// by the requested (possibly dotted) name.
    pub fn copy_present(&self, keys: &[String]) -> Attributes {
        let mut target = Attributes::new();
        for key in keys {
            if let Some(value) = self.lookup(key) {
                target.insert(key.clone(), value.clone());
            }
        }
        target
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Text form of a value as used for keys, type rules and statistics.
/// Strings are taken verbatim, `null` is empty.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
