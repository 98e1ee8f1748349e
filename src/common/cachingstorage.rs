//! Caching layer for JSON documents.
//!
//! Backup manifests are written once and read many times; a local file
//! cache makes `list` and `download` cheap. The cache is authoritative
//! for both once `upload` has written through to backend and cache.
//! Concurrent cache misses may both fetch - writes are last-writer-wins
//! because document names are unique per content.

use std::sync::Arc;

use log::warn;
use serde_json::Value;

use crate::common::error::StorageError;
use crate::common::storage::{FileStorage, JsonStorage};

pub struct CachingJsonStorage {
    backend: Arc<dyn JsonStorage>,
    cache: FileStorage,
}

impl CachingJsonStorage {
    pub fn new(backend: Arc<dyn JsonStorage>, cache: FileStorage) -> Self {
        Self { backend, cache }
    }
}

impl JsonStorage for CachingJsonStorage {
    fn upload_json(&self, name: &str, value: &Value) -> Result<bool, StorageError> {
        let uploaded = self.backend.upload_json(name, value)?;
        self.cache.upload_json(name, value)?;
        Ok(uploaded)
    }

    fn download_json(&self, name: &str) -> Result<Value, StorageError> {
        match self.cache.download_json(name) {
            Ok(value) => Ok(value),
            Err(StorageError::NotFound(_)) => {
                let value = self.backend.download_json(name)?;
                self.cache.upload_json(name, &value)?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    fn list_jsons(&self) -> Result<Vec<String>, StorageError> {
        self.cache.list_jsons()
    }

    fn delete_json(&self, name: &str) -> Result<(), StorageError> {
        self.backend.delete_json(name)?;
        if let Err(err) = self.cache.delete_json(name) {
            if !err.is_not_found() {
                warn!("cache invalidation of {:?} failed: {}", name, err);
            }
        }
        Ok(())
    }
}
