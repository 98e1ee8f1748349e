//! Protected object storage.
//!
//! Wraps a storage directory so that every stored object travels inside
//! the tagged [`DataBlob`](crate::common::data_blob::DataBlob) container,
//! compressed and/or encrypted. Construction refuses a configuration
//! with both disabled - blobs must never land in the object store
//! unprotected.
//!
//! The underlying handle is deliberately cheap to construct: the parallel
//! upload and download workers each build their own instead of sharing
//! one across threads.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::crypt_config::CryptConfig;
use crate::common::data_blob::DataBlob;
use crate::common::error::StorageError;
use crate::common::storage::{FileStorage, HexDigestStorage, JsonStorage};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Zstd,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    #[serde(default)]
    pub algorithm: Option<CompressionAlgorithm>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectStorageConfig {
    /// Object store directory.
    pub directory: PathBuf,
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Hex encoded 32 byte AES-256-GCM key.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

/// Blob-wrapping storage over a [`FileStorage`] directory.
pub struct ObjectStorage {
    backend: FileStorage,
    crypt_config: Option<CryptConfig>,
    compress: bool,
}

impl ObjectStorage {
    pub fn open(config: &ObjectStorageConfig) -> Result<Self, StorageError> {
        let compress = config.compression.algorithm.is_some();
        let crypt_config = match &config.encryption_key {
            Some(key) => Some(CryptConfig::from_hex_key(key)?),
            None => None,
        };
        if !compress && crypt_config.is_none() {
            return Err(StorageError::CompressionOrEncryptionRequired);
        }
        Ok(Self {
            backend: FileStorage::new(&config.directory)?,
            crypt_config,
            compress,
        })
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        let blob = DataBlob::encode(data, self.crypt_config.as_ref(), self.compress)?;
        Ok(blob.into_inner())
    }

    fn decode(&self, raw: Vec<u8>) -> Result<Vec<u8>, StorageError> {
        let blob = DataBlob::from_raw(raw)?;
        Ok(blob.decode(self.crypt_config.as_ref())?)
    }
}

impl HexDigestStorage for ObjectStorage {
    fn upload_hexdigest_bytes(&self, hexdigest: &str, data: &[u8]) -> Result<bool, StorageError> {
        let encoded = self.encode(data)?;
        self.backend.upload_hexdigest_bytes(hexdigest, &encoded)
    }

    fn upload_hexdigest_from_path(
        &self,
        hexdigest: &str,
        path: &Path,
    ) -> Result<bool, StorageError> {
        let data =
            fs::read(path).with_context(|| format!("reading upload source {:?}", path))?;
        self.upload_hexdigest_bytes(hexdigest, &data)
    }

    fn download_hexdigest_bytes(&self, hexdigest: &str) -> Result<Vec<u8>, StorageError> {
        let raw = self.backend.download_hexdigest_bytes(hexdigest)?;
        self.decode(raw)
    }

    fn download_hexdigest_to_path(
        &self,
        hexdigest: &str,
        path: &Path,
    ) -> Result<(), StorageError> {
        let data = self.download_hexdigest_bytes(hexdigest)?;
        fs::write(path, data).with_context(|| format!("writing download to {:?}", path))?;
        Ok(())
    }

    fn list_hexdigests(&self) -> Result<Vec<String>, StorageError> {
        self.backend.list_hexdigests()
    }

    fn delete_hexdigest(&self, hexdigest: &str) -> Result<(), StorageError> {
        self.backend.delete_hexdigest(hexdigest)
    }
}

impl JsonStorage for ObjectStorage {
    fn upload_json(&self, name: &str, value: &Value) -> Result<bool, StorageError> {
        let data = serde_json::to_vec(value).map_err(|err| StorageError::Other(err.into()))?;
        let encoded = self.encode(&data)?;
        self.backend.upload_json_bytes(name, &encoded)
    }

    fn download_json(&self, name: &str) -> Result<Value, StorageError> {
        let raw = self.backend.download_json_bytes(name)?;
        let data = self.decode(raw)?;
        serde_json::from_slice(&data).map_err(|err| {
            StorageError::Other(format_err!("document {:?} is not valid JSON: {}", name, err))
        })
    }

    fn list_jsons(&self) -> Result<Vec<String>, StorageError> {
        self.backend.list_jsons()
    }

    fn delete_json(&self, name: &str) -> Result<(), StorageError> {
        self.backend.delete_json(name)
    }
}
