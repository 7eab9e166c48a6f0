use crate::store::{validate_key, Collection, Store};
use async_trait::async_trait;
use convoy_core::{ConvoyError, ConvoyResult};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// File-based store: `<root>/<collection>/<key>.json`, one file per record.
///
/// Several processes may share one root. Writes go through a temporary
/// file so readers never observe a partial record; `create` publishes the
/// temporary file with a hard link, which fails atomically if the target
/// already exists.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating one directory per collection.
    pub async fn new(root: impl Into<PathBuf>) -> ConvoyResult<Self> {
        let root = root.into();
        for collection in Collection::ALL {
            tokio::fs::create_dir_all(root.join(collection.as_str())).await?;
        }
        Ok(Self { root })
    }

    /// Directory holding every collection.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.as_str())
    }

    // `:` is not portable in file names; `@` is never a valid key character
    // so the mapping cannot collide.
    fn record_path(&self, collection: Collection, key: &str) -> PathBuf {
        self.dir(collection)
            .join(format!("{}.json", key.replace(':', "@")))
    }

    async fn write_temp(&self, collection: Collection, value: &Value) -> ConvoyResult<PathBuf> {
        let tmp = self
            .dir(collection)
            .join(format!(".{}.tmp", Uuid::new_v4().simple()));
        let json = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, json).await?;
        Ok(tmp)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, collection: Collection, key: &str) -> ConvoyResult<Option<Value>> {
        validate_key(key)?;
        let path = self.record_path(collection, key);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let value = serde_json::from_slice(&data).map_err(|e| {
                    ConvoyError::Storage(format!("Corrupt record {}: {e}", path.display()))
                })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, collection: Collection, key: &str, value: &Value) -> ConvoyResult<()> {
        validate_key(key)?;
        let tmp = self.write_temp(collection, value).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.record_path(collection, key)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn create(
        &self,
        collection: Collection,
        key: &str,
        value: &Value,
    ) -> ConvoyResult<bool> {
        validate_key(key)?;
        let tmp = self.write_temp(collection, value).await?;
        let linked = tokio::fs::hard_link(&tmp, self.record_path(collection, key)).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, collection: Collection, key: &str) -> ConvoyResult<bool> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.record_path(collection, key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // The record is first renamed to a private tombstone, so of several
    // racing callers only one ever holds a given file. A tombstone that does
    // not match is linked back; that fails only if a new record was created
    // at the key in between, in which case the displaced one is dropped.
    async fn compare_and_delete(
        &self,
        collection: Collection,
        key: &str,
        expected: &Value,
    ) -> ConvoyResult<bool> {
        validate_key(key)?;
        let path = self.record_path(collection, key);
        let tomb = self
            .dir(collection)
            .join(format!(".{}.tomb", Uuid::new_v4().simple()));
        match tokio::fs::rename(&path, &tomb).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let matches = match tokio::fs::read(&tomb).await {
            Ok(data) => serde_json::from_slice::<Value>(&data).is_ok_and(|v| &v == expected),
            Err(e) => {
                let _ = tokio::fs::rename(&tomb, &path).await;
                return Err(e.into());
            }
        };
        if matches {
            tokio::fs::remove_file(&tomb).await?;
            return Ok(true);
        }

        let restored = tokio::fs::hard_link(&tomb, &path).await;
        let _ = tokio::fs::remove_file(&tomb).await;
        match restored {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(
                    collection = %collection,
                    key,
                    "Record replaced while being compared; displaced copy dropped"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, collection: Collection) -> ConvoyResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(self.dir(collection)).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with('.') {
                    continue;
                }
                if let Some(stem) = name.strip_suffix(".json") {
                    keys.push(stem.replace('@', ":"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
