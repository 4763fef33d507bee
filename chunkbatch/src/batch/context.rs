//! Key-value execution context.
//!
//! An [`ExecutionContext`] is the only state that survives between runs of a
//! job instance. Steps and item streams store their progress in it, the
//! engine persists it at every chunk commit, and a restart seeds the new
//! execution from the last committed copy.
//!
//! Values are stored as `serde_json::Value` so that the whole context can be
//! written to a repository as one serialized blob.
//!
//! # Example
//!
//! ```ignore
//! use chunkbatch::batch::ExecutionContext;
//!
//! let mut ctx = ExecutionContext::new();
//! ctx.put("reader.position", 42);
//! assert_eq!(ctx.get_i64("reader.position"), Some(42));
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Ordered key-value map persisted with its owning execution.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    entries: BTreeMap<String, Value>,
    #[serde(skip)]
    dirty: bool,
}

impl ExecutionContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, replacing any previous value under the same key.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if self.entries.get(&key) != Some(&value) {
            self.entries.insert(key, value);
            self.dirty = true;
        }
    }

    /// Stores any serializable value.
    pub fn put_serialized<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.put(key, value);
        Ok(())
    }

    /// Returns the raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.entries.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.entries.get(key).and_then(Value::as_bool)
    }

    /// Deserializes the value under `key` into `T`.
    ///
    /// Returns `Ok(None)` when the key is absent.
    pub fn get_deserialized<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, serde_json::Error> {
        match self.entries.get(key) {
            Some(value) => serde_json::from_value(value.clone()).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes a key, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns true if the context changed since the last [`clear_dirty`](Self::clear_dirty).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the context as persisted.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Serializes the context into the blob stored by a repository.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.entries)
    }

    /// Restores a context from a repository blob.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let entries = serde_json::from_str(json)?;
        Ok(Self {
            entries,
            dirty: false,
        })
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ExecutionContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut ctx = Self::new();
        for (k, v) in iter {
            ctx.put(k, v);
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_typed_get() {
        let mut ctx = ExecutionContext::new();
        ctx.put("name", "alpha");
        ctx.put("count", 7);
        ctx.put("ratio", 0.5);
        ctx.put("done", true);

        assert_eq!(ctx.get_string("name"), Some("alpha"));
        assert_eq!(ctx.get_i64("count"), Some(7));
        assert_eq!(ctx.get_f64("ratio"), Some(0.5));
        assert_eq!(ctx.get_bool("done"), Some(true));
        assert_eq!(ctx.get_i64("name"), None);
    }

    #[test]
    fn test_dirty_tracking() {
        let mut ctx = ExecutionContext::new();
        assert!(!ctx.is_dirty());

        ctx.put("a", 1);
        assert!(ctx.is_dirty());

        ctx.clear_dirty();
        ctx.put("a", 1);
        assert!(!ctx.is_dirty(), "Same value should not mark dirty");

        ctx.remove("a");
        assert!(ctx.is_dirty());
    }

    #[test]
    fn test_iteration_is_key_ordered() {
        let ctx: ExecutionContext = [("b", 2), ("a", 1), ("c", 3)].into_iter().collect();
        let keys: Vec<&str> = ctx.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_json_blob_restores_entries() {
        let mut ctx = ExecutionContext::new();
        ctx.put("min_value", 1);
        ctx.put("max_value", 100);

        let blob = ctx.to_json().unwrap();
        let restored = ExecutionContext::from_json(&blob).unwrap();

        assert_eq!(restored.get_i64("min_value"), Some(1));
        assert_eq!(restored.get_i64("max_value"), Some(100));
        assert!(!restored.is_dirty());
    }

    #[test]
    fn test_serialized_values() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Cursor {
            page: u32,
            offset: u32,
        }

        let mut ctx = ExecutionContext::new();
        ctx.put_serialized("cursor", &Cursor { page: 2, offset: 10 })
            .unwrap();

        let cursor: Option<Cursor> = ctx.get_deserialized("cursor").unwrap();
        assert_eq!(cursor, Some(Cursor { page: 2, offset: 10 }));

        let missing: Option<Cursor> = ctx.get_deserialized("missing").unwrap();
        assert!(missing.is_none());
    }
}
