use fxhash::FxHashMap;
use serde::Serialize;

use super::error::StoreError;

/// Key of the permanent list of active group names
pub const GROUPS_KEY: &str = "GROUPS";
/// Prefix of per-event keys
pub const EVENT_PREFIX: &str = "EVENT:";
/// Prefix of static (header) keys
pub const INPUT_PREFIX: &str = "INPUT:";

/// A single datum held in the DataStore.
///
/// Waveforms are widened to i32 so that signed (BlueTongue, text) and unsigned (CAEN)
/// samples share one representation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Ints(Vec<i64>),
    Waveform(Vec<i32>),
    Names(Vec<String>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Self::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_waveform(&self) -> Option<&[i32]> {
        match self {
            Self::Waveform(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_names(&self) -> Option<&[String]> {
        match self {
            Self::Names(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Int(value as i64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<i32>> for Value {
    fn from(value: Vec<i32>) -> Self {
        Self::Waveform(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Self::Names(value)
    }
}

/// DataStore is the two-zone key-value store through which the merger talks to its
/// consumers.
///
/// The transient zone belongs to the global event currently being built and is cleared
/// before the next one. The permanent zone lives for the whole run. A key only ever
/// lives in one zone; a miss is reported as `None`.
#[derive(Debug, Default)]
pub struct DataStore {
    transient: FxHashMap<String, Value>,
    permanent: FxHashMap<String, Value>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a transient value, valid until the next global event
    pub fn put(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        if self.permanent.contains_key(key) {
            return Err(StoreError::LifetimeConflict(key.to_string()));
        }
        self.transient.insert(key.to_string(), value);
        Ok(())
    }

    /// Write a permanent value. Any transient value under the same key is dropped.
    ///
    /// The store takes ownership; clone at the call site to keep a copy.
    pub fn save(&mut self, key: &str, value: Value) {
        self.transient.remove(key);
        self.permanent.insert(key.to_string(), value);
    }

    /// Look up a key, transient zone first
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.transient.get(key).or_else(|| self.permanent.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.transient.contains_key(key) || self.permanent.contains_key(key)
    }

    pub fn clear_transient(&mut self) {
        self.transient.clear();
    }

    pub fn transient_len(&self) -> usize {
        self.transient.len()
    }

    pub fn permanent_len(&self) -> usize {
        self.permanent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_shadows_nothing_after_clear() {
        let mut store = DataStore::new();
        store.put("EVENT:a:timestamp", Value::Int(10)).unwrap();
        store.save("INPUT:a:n_boards", Value::Int(2));
        assert_eq!(store.get("EVENT:a:timestamp"), Some(&Value::Int(10)));
        store.clear_transient();
        assert_eq!(store.get("EVENT:a:timestamp"), None);
        assert_eq!(store.get("INPUT:a:n_boards"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_key_lives_in_one_zone() {
        let mut store = DataStore::new();
        store.put("x", Value::Int(1)).unwrap();
        store.save("x", Value::Int(2));
        assert_eq!(store.transient_len(), 0);
        assert_eq!(store.get("x"), Some(&Value::Int(2)));
        assert!(matches!(
            store.put("x", Value::Int(3)),
            Err(StoreError::LifetimeConflict(_))
        ));
    }
}
