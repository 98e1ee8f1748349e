//! Object store facade.
//!
//! Two capabilities composed in one abstraction: hex digest keyed content
//! blobs, and named JSON documents. [`FileStorage`] is the plain
//! directory implementation used for tests and as the local cache of the
//! caching JSON layer; the protected production implementation lives in
//! [`crate::common::objectstorage`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context};
use serde_json::Value;

use crate::common::error::StorageError;

const JSON_SUFFIX: &str = ".json";

/// Content addressed blob storage; uploads are idempotent by key.
pub trait HexDigestStorage: Send + Sync {
    fn upload_hexdigest_bytes(&self, hexdigest: &str, data: &[u8]) -> Result<bool, StorageError>;
    fn upload_hexdigest_from_path(&self, hexdigest: &str, path: &Path)
        -> Result<bool, StorageError>;
    fn download_hexdigest_bytes(&self, hexdigest: &str) -> Result<Vec<u8>, StorageError>;
    fn download_hexdigest_to_path(&self, hexdigest: &str, path: &Path)
        -> Result<(), StorageError>;
    fn list_hexdigests(&self) -> Result<Vec<String>, StorageError>;
    fn delete_hexdigest(&self, hexdigest: &str) -> Result<(), StorageError>;
}

/// Same shape over named JSON documents.
pub trait JsonStorage: Send + Sync {
    fn upload_json(&self, name: &str, value: &Value) -> Result<bool, StorageError>;
    fn download_json(&self, name: &str) -> Result<Value, StorageError>;
    fn list_jsons(&self) -> Result<Vec<String>, StorageError>;
    fn delete_json(&self, name: &str) -> Result<(), StorageError>;
}

pub trait Storage: HexDigestStorage + JsonStorage {}

impl<T: HexDigestStorage + JsonStorage> Storage for T {}

/// Plain directory storage: blobs under their hexdigest, JSON documents
/// under `<name>.json`.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self, StorageError> {
        let path = path.into();
        fs::create_dir_all(&path)
            .with_context(|| format!("unable to create storage directory {:?}", path))?;
        Ok(Self { path })
    }

    fn hexdigest_path(&self, hexdigest: &str) -> PathBuf {
        self.path.join(hexdigest)
    }

    fn json_path(&self, name: &str) -> PathBuf {
        self.path.join(format!("{}{}", name, JSON_SUFFIX))
    }

    fn read(&self, path: &Path, key: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(path) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(format_err!("reading {:?} failed: {}", path, err).into()),
        }
    }

    fn delete(&self, path: &Path, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(format_err!("deleting {:?} failed: {}", path, err).into()),
        }
    }

    /// Raw bytes of a named document; the protected storage layers their
    /// own container format on top of these.
    pub fn upload_json_bytes(&self, name: &str, data: &[u8]) -> Result<bool, StorageError> {
        crate::tools::file_set_contents(self.json_path(name), data)?;
        Ok(true)
    }

    pub fn download_json_bytes(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.read(&self.json_path(name), name)
    }

    fn list(&self, jsons: bool) -> Result<Vec<String>, StorageError> {
        let mut result = Vec::new();
        for entry in fs::read_dir(&self.path)
            .with_context(|| format!("unable to list storage directory {:?}", self.path))?
        {
            let entry = entry.map_err(|err| StorageError::Other(err.into()))?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            match (jsons, name.ends_with(JSON_SUFFIX)) {
                (true, true) => result.push(name[..name.len() - JSON_SUFFIX.len()].to_string()),
                (false, false) => result.push(name),
                _ => {}
            }
        }
        result.sort();
        Ok(result)
    }
}

impl HexDigestStorage for FileStorage {
    fn upload_hexdigest_bytes(&self, hexdigest: &str, data: &[u8]) -> Result<bool, StorageError> {
        crate::tools::file_set_contents(self.hexdigest_path(hexdigest), data)?;
        Ok(true)
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
        self.read(&self.hexdigest_path(hexdigest), hexdigest)
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
        self.list(false)
    }

    fn delete_hexdigest(&self, hexdigest: &str) -> Result<(), StorageError> {
        self.delete(&self.hexdigest_path(hexdigest), hexdigest)
    }
}

impl JsonStorage for FileStorage {
    fn upload_json(&self, name: &str, value: &Value) -> Result<bool, StorageError> {
        let data = serde_json::to_vec(value).map_err(|err| StorageError::Other(err.into()))?;
        self.upload_json_bytes(name, &data)
    }

    fn download_json(&self, name: &str) -> Result<Value, StorageError> {
        let data = self.download_json_bytes(name)?;
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("document {:?} is not valid JSON: {}", name, err).into())
    }

    fn list_jsons(&self) -> Result<Vec<String>, StorageError> {
        self.list(true)
    }

    fn delete_json(&self, name: &str) -> Result<(), StorageError> {
        self.delete(&self.json_path(name), name)
    }
}
