//! Round-trip: snapshot, upload, then download reproduces the source
//! tree byte for byte, including mtimes, with no extra files left over.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use chrono::Utc;
use serde_json::json;

use astacus::common::ipc::{BackupManifest, SnapshotResult};
use astacus::common::objectstorage::{
    CompressionAlgorithm, CompressionConfig, ObjectStorage, ObjectStorageConfig,
};
use astacus::common::progress::ProgressHandle;
use astacus::common::storage::JsonStorage;
use astacus::node::download::Downloader;
use astacus::node::snapshot::Uploader;
use astacus::node::snapshotter::Snapshotter;

fn mtime_ns(path: &Path) -> i64 {
    let meta = fs::metadata(path).unwrap();
    meta.mtime() * 1_000_000_000 + meta.mtime_nsec()
}

#[test]
fn test_restore_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let mirror = dir.path().join("mirror");
    let storage_dir = dir.path().join("storage");
    fs::create_dir_all(src.join("nested")).unwrap();
    fs::create_dir_all(&mirror).unwrap();

    fs::write(src.join("foo"), "foobar").unwrap();
    fs::write(src.join("foo2"), "foobar").unwrap();
    fs::write(src.join("foobig"), "foobar".repeat(100)).unwrap();
    fs::write(src.join("foobig2"), "foobar".repeat(100)).unwrap();
    fs::write(src.join("nested/deep"), "deep".repeat(50)).unwrap();

    let storage_config = ObjectStorageConfig {
        directory: storage_dir,
        compression: CompressionConfig {
            algorithm: Some(CompressionAlgorithm::Zstd),
        },
        encryption_key: Some("22".repeat(32)),
    };

    // backup side
    let mut snapshotter = Snapshotter::new(
        src.clone(),
        mirror,
        &["**/*".to_string()],
        None,
        100,
    )
    .unwrap();
    assert!(snapshotter.snapshot(&ProgressHandle::new()).unwrap() > 0);
    let state = snapshotter.get_snapshot_state();
    let hashes = snapshotter.get_snapshot_hashes();

    let uploader = Uploader {
        storage_config: storage_config.clone(),
        parallel: 2,
    };
    let progress = ProgressHandle::new();
    let hexdigests: Vec<String> = hashes.iter().map(|hash| hash.hexdigest.clone()).collect();
    uploader
        .write_hashes_to_storage(&snapshotter, &hexdigests, &progress, || true)
        .unwrap();
    assert!(progress.finished_successfully());

    let manifest = BackupManifest {
        attempt: 1,
        start: Utc::now(),
        snapshot_results: vec![SnapshotResult {
            state: Some(state.clone()),
            hashes,
            ..Default::default()
        }],
        plugin: "files".to_string(),
        plugin_data: json!({}),
    };
    let storage = ObjectStorage::open(&storage_config).unwrap();
    storage
        .upload_json("backup-x", &serde_json::to_value(&manifest).unwrap())
        .unwrap();

    // restore side: fresh root, plus one stray file that must disappear
    let restore_root = dir.path().join("restore");
    let restore_mirror = dir.path().join("restore-mirror");
    fs::create_dir_all(&restore_root).unwrap();
    fs::create_dir_all(&restore_mirror).unwrap();
    fs::write(restore_root.join("stray"), "should not survive").unwrap();

    let mut restore_snapshotter = Snapshotter::new(
        restore_root.clone(),
        restore_mirror,
        &["**/*".to_string()],
        None,
        100,
    )
    .unwrap();
    let downloader = Downloader {
        dst: restore_root.clone(),
        storage_config,
        parallel: 2,
    };
    let progress = ProgressHandle::new();
    downloader
        .download_from_storage(&mut restore_snapshotter, &state, &progress, || true)
        .unwrap();
    assert!(progress.finished_successfully());

    // identical content and mtimes, no extras
    for file in &state.files {
        let src_path = src.join(&file.relative_path);
        let restored_path = restore_root.join(&file.relative_path);
        assert_eq!(
            fs::read(&src_path).unwrap(),
            fs::read(&restored_path).unwrap(),
            "content mismatch for {}",
            file.relative_path
        );
        assert_eq!(
            file.mtime_ns,
            mtime_ns(&restored_path),
            "mtime mismatch for {}",
            file.relative_path
        );
    }
    assert!(!restore_root.join("stray").exists());

    // a second restore over the same tree is a no-op that still succeeds
    let progress = ProgressHandle::new();
    downloader
        .download_from_storage(&mut restore_snapshotter, &state, &progress, || true)
        .unwrap();
    assert!(progress.finished_successfully());
}
