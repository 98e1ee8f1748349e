//! Async facade over the blocking storage API.
//!
//! The subset of the storage API the coordinator calls from its
//! cooperative tasks, proxied to the blocking thread pool. Access is
//! intentionally not locked; the underlying storage is safe for
//! concurrent use because operations are keyed by hexdigest or name.

use std::sync::Arc;

use anyhow::format_err;
use serde_json::Value;

use crate::common::error::StorageError;
use crate::common::storage::{HexDigestStorage, JsonStorage};

async fn run_blocking<R, F>(fun: F) -> Result<R, StorageError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(fun)
        .await
        .map_err(|err| StorageError::Other(format_err!("storage task panicked: {}", err)))?
}

#[derive(Clone)]
pub struct AsyncHexDigestStorage {
    storage: Arc<dyn HexDigestStorage>,
}

impl AsyncHexDigestStorage {
    pub fn new(storage: Arc<dyn HexDigestStorage>) -> Self {
        Self { storage }
    }

    pub async fn list_hexdigests(&self) -> Result<Vec<String>, StorageError> {
        let storage = self.storage.clone();
        run_blocking(move || storage.list_hexdigests()).await
    }

    pub async fn delete_hexdigest(&self, hexdigest: &str) -> Result<(), StorageError> {
        let storage = self.storage.clone();
        let hexdigest = hexdigest.to_string();
        run_blocking(move || storage.delete_hexdigest(&hexdigest)).await
    }
}

#[derive(Clone)]
pub struct AsyncJsonStorage {
    storage: Arc<dyn JsonStorage>,
}

impl AsyncJsonStorage {
    pub fn new(storage: Arc<dyn JsonStorage>) -> Self {
        Self { storage }
    }

    pub async fn upload_json(&self, name: &str, value: &Value) -> Result<bool, StorageError> {
        let storage = self.storage.clone();
        let name = name.to_string();
        let value = value.clone();
        run_blocking(move || storage.upload_json(&name, &value)).await
    }

    pub async fn download_json(&self, name: &str) -> Result<Value, StorageError> {
        let storage = self.storage.clone();
        let name = name.to_string();
        run_blocking(move || storage.download_json(&name)).await
    }

    pub async fn list_jsons(&self) -> Result<Vec<String>, StorageError> {
        let storage = self.storage.clone();
        run_blocking(move || storage.list_jsons()).await
    }

    pub async fn delete_json(&self, name: &str) -> Result<(), StorageError> {
        let storage = self.storage.clone();
        let name = name.to_string();
        run_blocking(move || storage.delete_json(&name)).await
    }
}
