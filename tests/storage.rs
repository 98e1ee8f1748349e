//! Storage facade behavior: both capabilities, the protected object
//! store, and the caching JSON layer.

use std::sync::Arc;

use serde_json::json;

use astacus::common::cachingstorage::CachingJsonStorage;
use astacus::common::error::StorageError;
use astacus::common::objectstorage::{
    CompressionAlgorithm, CompressionConfig, ObjectStorage, ObjectStorageConfig,
};
use astacus::common::storage::{FileStorage, HexDigestStorage, JsonStorage};

const TEST_HEXDIGEST: &str = "deadbeef";
const TEST_JSON: &str = "jsonblob";

fn test_data() -> Vec<u8> {
    b"data".repeat(15)
}

fn test_json_data() -> serde_json::Value {
    json!({"foo": 7, "array": [1, 2, 3], "true": true})
}

fn object_storage_config(
    directory: &std::path::Path,
    compression: bool,
    encryption: bool,
) -> ObjectStorageConfig {
    ObjectStorageConfig {
        directory: directory.to_path_buf(),
        compression: CompressionConfig {
            algorithm: if compression {
                Some(CompressionAlgorithm::Zstd)
            } else {
                None
            },
        },
        encryption_key: if encryption {
            Some("11".repeat(32))
        } else {
            None
        },
    }
}

fn exercise_hexdigest_storage(storage: &dyn HexDigestStorage) {
    assert!(storage
        .upload_hexdigest_bytes(TEST_HEXDIGEST, &test_data())
        .unwrap());
    assert_eq!(
        storage.download_hexdigest_bytes(TEST_HEXDIGEST).unwrap(),
        test_data()
    );
    match storage.download_hexdigest_bytes("deadbeefx") {
        Err(StorageError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }
    assert_eq!(storage.list_hexdigests().unwrap(), vec![TEST_HEXDIGEST]);
    storage.delete_hexdigest(TEST_HEXDIGEST).unwrap();
    match storage.delete_hexdigest("deadbeefx") {
        Err(StorageError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert!(storage.list_hexdigests().unwrap().is_empty());
}

fn exercise_json_storage(storage: &dyn JsonStorage) {
    assert!(storage.list_jsons().unwrap().is_empty());
    assert!(storage.upload_json(TEST_JSON, &test_json_data()).unwrap());
    assert_eq!(storage.download_json(TEST_JSON).unwrap(), test_json_data());
    match storage.download_json("jsonblobx") {
        Err(StorageError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }
    assert_eq!(storage.list_jsons().unwrap(), vec![TEST_JSON]);
    storage.delete_json(TEST_JSON).unwrap();
    match storage.delete_json("jsonblobx") {
        Err(StorageError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert!(storage.list_jsons().unwrap().is_empty());
}

#[test]
fn test_file_storage() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::new(dir.path().join("storage")).unwrap();
    exercise_hexdigest_storage(&storage);
    exercise_json_storage(&storage);
}

#[test]
fn test_object_storage_compressed() {
    let dir = tempfile::tempdir().unwrap();
    let storage =
        ObjectStorage::open(&object_storage_config(dir.path(), true, false)).unwrap();
    exercise_hexdigest_storage(&storage);
    exercise_json_storage(&storage);
}

#[test]
fn test_object_storage_encrypted() {
    let dir = tempfile::tempdir().unwrap();
    let storage =
        ObjectStorage::open(&object_storage_config(dir.path(), false, true)).unwrap();
    exercise_hexdigest_storage(&storage);
    exercise_json_storage(&storage);
}

#[test]
fn test_object_storage_compressed_and_encrypted() {
    let dir = tempfile::tempdir().unwrap();
    let storage = ObjectStorage::open(&object_storage_config(dir.path(), true, true)).unwrap();
    exercise_hexdigest_storage(&storage);
    exercise_json_storage(&storage);
}

#[test]
fn test_object_storage_refuses_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    match ObjectStorage::open(&object_storage_config(dir.path(), false, false)) {
        Err(StorageError::CompressionOrEncryptionRequired) => {}
        other => panic!(
            "expected CompressionOrEncryptionRequired, got {:?}",
            other.map(|_| ())
        ),
    }
}

#[test]
fn test_stored_objects_are_not_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let storage = ObjectStorage::open(&object_storage_config(dir.path(), true, true)).unwrap();
    storage
        .upload_hexdigest_bytes(TEST_HEXDIGEST, &test_data())
        .unwrap();
    let raw = std::fs::read(dir.path().join(TEST_HEXDIGEST)).unwrap();
    assert_ne!(raw, test_data());
    // no plaintext window either
    assert!(!raw.windows(4).any(|window| window == b"data"));
}

#[test]
fn test_caching_storage() {
    let dir = tempfile::tempdir().unwrap();
    let backend_dir = dir.path().join("backend");
    let cache_dir = dir.path().join("cache");

    let backend: Arc<dyn JsonStorage> =
        Arc::new(ObjectStorage::open(&object_storage_config(&backend_dir, true, false)).unwrap());
    let storage = CachingJsonStorage::new(
        backend.clone(),
        FileStorage::new(&cache_dir).unwrap(),
    );
    storage.upload_json(TEST_JSON, &test_json_data()).unwrap();

    // a fresh instance over the same directories serves from the cache
    let storage = CachingJsonStorage::new(backend, FileStorage::new(&cache_dir).unwrap());
    assert_eq!(storage.list_jsons().unwrap(), vec![TEST_JSON]);

    // wipe the backend; the cache must remain authoritative
    std::fs::remove_file(backend_dir.join(format!("{}.json", TEST_JSON))).unwrap();
    assert_eq!(storage.download_json(TEST_JSON).unwrap(), test_json_data());
    assert_eq!(storage.list_jsons().unwrap(), vec![TEST_JSON]);
}

#[test]
fn test_caching_storage_fills_cache_on_miss() {
    let dir = tempfile::tempdir().unwrap();
    let backend_dir = dir.path().join("backend");

    let backend: Arc<dyn JsonStorage> =
        Arc::new(ObjectStorage::open(&object_storage_config(&backend_dir, true, false)).unwrap());
    backend.upload_json(TEST_JSON, &test_json_data()).unwrap();

    let storage = CachingJsonStorage::new(
        backend,
        FileStorage::new(dir.path().join("cache")).unwrap(),
    );
    // not listed (cache is empty), but a direct download falls through
    assert!(storage.list_jsons().unwrap().is_empty());
    assert_eq!(storage.download_json(TEST_JSON).unwrap(), test_json_data());
    // and the fetch populated the cache
    assert_eq!(storage.list_jsons().unwrap(), vec![TEST_JSON]);
}
