use crate::store::{validate_key, Collection, Store};
use async_trait::async_trait;
use convoy_core::ConvoyResult;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Process-local store. Every operation is atomic under one mutex.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Collection, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection.
    pub fn len(&self, collection: Collection) -> usize {
        self.records
            .lock()
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, collection: Collection, key: &str) -> ConvoyResult<Option<Value>> {
        validate_key(key)?;
        Ok(self
            .records
            .lock()
            .get(&collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn put(&self, collection: Collection, key: &str, value: &Value) -> ConvoyResult<()> {
        validate_key(key)?;
        self.records
            .lock()
            .entry(collection)
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn create(
        &self,
        collection: Collection,
        key: &str,
        value: &Value,
    ) -> ConvoyResult<bool> {
        validate_key(key)?;
        let mut records = self.records.lock();
        let entries = records.entry(collection).or_default();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.clone());
        Ok(true)
    }

    async fn delete(&self, collection: Collection, key: &str) -> ConvoyResult<bool> {
        validate_key(key)?;
        Ok(self
            .records
            .lock()
            .get_mut(&collection)
            .and_then(|c| c.remove(key))
            .is_some())
    }

    async fn compare_and_delete(
        &self,
        collection: Collection,
        key: &str,
        expected: &Value,
    ) -> ConvoyResult<bool> {
        validate_key(key)?;
        let mut records = self.records.lock();
        let Some(entries) = records.get_mut(&collection) else {
            return Ok(false);
        };
        if entries.get(key) == Some(expected) {
            entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list(&self, collection: Collection) -> ConvoyResult<Vec<String>> {
        Ok(self
            .records
            .lock()
            .get(&collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn values(&self, collection: Collection) -> ConvoyResult<Vec<Value>> {
        Ok(self
            .records
            .lock()
            .get(&collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}
