//! Record storage for the Convoy orchestrator.
//!
//! Every durable record (agent, task, workflow, result, lock) lives in a
//! [`Collection`] of a [`Store`]. Two backends are provided:
//!
//! - [`MemoryStore`]: a mutex-guarded map, for tests and single-process use.
//! - [`FileStore`]: one JSON file per record, shared by cooperating processes.

pub mod file;
pub mod memory;
pub mod store;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{insert, load, load_all, save, validate_key, Collection, Store};

use convoy_core::{ConvoyResult, StorageBackend, StorageConfig};
use std::sync::Arc;

/// Open the backend selected by the configuration.
pub async fn open(config: &StorageConfig) -> ConvoyResult<Arc<dyn Store>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::File => Ok(Arc::new(FileStore::new(&config.data_dir).await?)),
    }
}
