use async_trait::async_trait;
use convoy_core::{ConvoyError, ConvoyResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Logical record spaces. Each one is an independent key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Agents,
    AgentArchive,
    Tasks,
    TaskArchive,
    Workflows,
    Results,
    Aggregates,
    Locks,
}

impl Collection {
    /// Every collection, in layout order.
    pub const ALL: [Collection; 8] = [
        Collection::Agents,
        Collection::AgentArchive,
        Collection::Tasks,
        Collection::TaskArchive,
        Collection::Workflows,
        Collection::Results,
        Collection::Aggregates,
        Collection::Locks,
    ];

    /// Stable name, also used as the directory name by the file store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Agents => "agents",
            Collection::AgentArchive => "agents_archive",
            Collection::Tasks => "tasks",
            Collection::TaskArchive => "tasks_archive",
            Collection::Workflows => "workflows",
            Collection::Results => "results",
            Collection::Aggregates => "aggregates",
            Collection::Locks => "locks",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyed JSON record storage shared by every Convoy component.
///
/// `create` must be atomic: when several callers (threads or processes)
/// race on the same key, exactly one of them observes `true`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read one record.
    async fn get(&self, collection: Collection, key: &str) -> ConvoyResult<Option<Value>>;

    /// Write one record, replacing any previous value.
    async fn put(&self, collection: Collection, key: &str, value: &Value) -> ConvoyResult<()>;

    /// Write one record only if the key is absent. Returns whether it was written.
    async fn create(&self, collection: Collection, key: &str, value: &Value)
        -> ConvoyResult<bool>;

    /// Remove one record. Returns whether it existed.
    async fn delete(&self, collection: Collection, key: &str) -> ConvoyResult<bool>;

    /// Remove a record only if its current value equals `expected`.
    async fn compare_and_delete(
        &self,
        collection: Collection,
        key: &str,
        expected: &Value,
    ) -> ConvoyResult<bool>;

    /// All keys in a collection, sorted.
    async fn list(&self, collection: Collection) -> ConvoyResult<Vec<String>>;

    /// All values in a collection, in key order. Records deleted between
    /// listing and reading are skipped.
    async fn values(&self, collection: Collection) -> ConvoyResult<Vec<Value>> {
        let mut values = Vec::new();
        for key in self.list(collection).await? {
            if let Some(value) = self.get(collection, &key).await? {
                values.push(value);
            }
        }
        Ok(values)
    }
}

/// Reject keys that could escape a collection or collide after mapping.
///
/// Allowed: 1–200 characters from `[A-Za-z0-9_.:-]`, not starting with `.`.
pub fn validate_key(key: &str) -> ConvoyResult<()> {
    let valid = !key.is_empty()
        && key.len() <= 200
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ConvoyError::Validation(format!("Invalid record key: '{key}'")))
    }
}

/// Typed read.
pub async fn load<T: DeserializeOwned>(
    store: &dyn Store,
    collection: Collection,
    key: &str,
) -> ConvoyResult<Option<T>> {
    match store.get(collection, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Typed overwrite.
pub async fn save<T: Serialize + Sync>(
    store: &dyn Store,
    collection: Collection,
    key: &str,
    record: &T,
) -> ConvoyResult<()> {
    let value = serde_json::to_value(record)?;
    store.put(collection, key, &value).await
}

/// Typed create-if-absent.
pub async fn insert<T: Serialize + Sync>(
    store: &dyn Store,
    collection: Collection,
    key: &str,
    record: &T,
) -> ConvoyResult<bool> {
    let value = serde_json::to_value(record)?;
    store.create(collection, key, &value).await
}

/// Typed read of a whole collection. Records that fail to decode are
/// logged and skipped so one corrupt file cannot stall every scan.
pub async fn load_all<T: DeserializeOwned>(
    store: &dyn Store,
    collection: Collection,
) -> ConvoyResult<Vec<T>> {
    let mut records = Vec::new();
    for value in store.values(collection).await? {
        match serde_json::from_value(value) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "Skipping undecodable record");
            }
        }
    }
    Ok(records)
}
