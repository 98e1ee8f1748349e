//! Snapshot semantics: determinism, change detection, embedding of small
//! files, and the upload path's re-hash gates.

use std::fs;
use std::path::Path;

use astacus::common::ipc::SnapshotHash;
use astacus::common::objectstorage::{
    CompressionAlgorithm, CompressionConfig, ObjectStorage, ObjectStorageConfig,
};
use astacus::common::progress::ProgressHandle;
use astacus::common::storage::HexDigestStorage;
use astacus::node::snapshot::Uploader;
use astacus::node::snapshotter::Snapshotter;

const FOOBIG_HEXDIGEST: &str = "326827fe6fd23503bf16eed91861766df522748794814a1bf46d479d9feae1a0";

struct Fixture {
    _dir: tempfile::TempDir,
    src: std::path::PathBuf,
    dst: std::path::PathBuf,
    storage_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let storage_dir = dir.path().join("storage");
    fs::create_dir_all(&src).unwrap();
    fs::create_dir_all(&dst).unwrap();
    Fixture {
        src,
        dst,
        storage_dir,
        _dir: dir,
    }
}

fn snapshotter(fixture: &Fixture) -> Snapshotter {
    Snapshotter::new(
        fixture.src.clone(),
        fixture.dst.clone(),
        &["*".to_string()],
        None,
        100,
    )
    .unwrap()
}

fn storage_config(fixture: &Fixture) -> ObjectStorageConfig {
    ObjectStorageConfig {
        directory: fixture.storage_dir.clone(),
        compression: CompressionConfig {
            algorithm: Some(CompressionAlgorithm::Zstd),
        },
        encryption_key: None,
    }
}

fn create_4foobar(src: &Path) {
    fs::write(src.join("foo"), "foobar").unwrap();
    fs::write(src.join("foo2"), "foobar").unwrap();
    fs::write(src.join("foobig"), "foobar".repeat(100)).unwrap();
    fs::write(src.join("foobig2"), "foobar".repeat(100)).unwrap();
}

#[test]
fn test_snapshot() {
    let fixture = fixture();
    let mut snapshotter = snapshotter(&fixture);

    // start with empty
    assert_eq!(snapshotter.snapshot(&ProgressHandle::new()).unwrap(), 0);
    assert!(!fixture.dst.join("foo").is_file());

    create_4foobar(&fixture.src);
    assert!(snapshotter.snapshot(&ProgressHandle::new()).unwrap() > 0);
    let ss2 = snapshotter.get_snapshot_state();

    assert!(fixture.dst.join("foo").is_file());
    assert_eq!(fs::read_to_string(fixture.dst.join("foo")).unwrap(), "foobar");
    assert_eq!(fs::read_to_string(fixture.dst.join("foo2")).unwrap(), "foobar");

    // the small pair is embedded; only the big content is a blob
    let hashes = snapshotter.get_snapshot_hashes();
    assert_eq!(
        hashes,
        vec![SnapshotHash {
            hexdigest: FOOBIG_HEXDIGEST.to_string(),
            size: 600,
        }]
    );

    // equal-length rewrite; may take retries due to mtime granularity
    loop {
        fs::write(fixture.src.join("foo"), "barfoo").unwrap();
        if snapshotter.snapshot(&ProgressHandle::new()).unwrap() > 0 {
            break;
        }
    }
    let ss3 = snapshotter.get_snapshot_state();
    assert_ne!(ss2, ss3);
    assert_eq!(snapshotter.snapshot(&ProgressHandle::new()).unwrap(), 0);
    assert_eq!(fs::read_to_string(fixture.dst.join("foo")).unwrap(), "barfoo");

    // upload the blob
    let uploader = Uploader {
        storage_config: storage_config(&fixture),
        parallel: 1,
    };
    let progress = ProgressHandle::new();
    let hexdigests: Vec<String> = hashes.iter().map(|hash| hash.hexdigest.clone()).collect();
    uploader
        .write_hashes_to_storage(&snapshotter, &hexdigests, &progress, || true)
        .unwrap();
    assert!(progress.finished_successfully());
    let storage = ObjectStorage::open(&storage_config(&fixture)).unwrap();
    assert_eq!(storage.list_hexdigests().unwrap(), vec![FOOBIG_HEXDIGEST]);
    assert_eq!(
        storage.download_hexdigest_bytes(FOOBIG_HEXDIGEST).unwrap(),
        "foobar".repeat(100).into_bytes()
    );

    // remove files one at a time; each removal is one change
    for filename in ["foo", "foo2", "foobig", "foobig2"].iter() {
        fs::remove_file(fixture.src.join(filename)).unwrap();
        assert!(snapshotter.snapshot(&ProgressHandle::new()).unwrap() > 0);
        assert_eq!(snapshotter.snapshot(&ProgressHandle::new()).unwrap(), 0);
        assert!(!fixture.dst.join(filename).is_file());
    }
    assert!(snapshotter.get_snapshot_hashes().is_empty());
    assert!(snapshotter.get_snapshot_state().files.is_empty());
}

#[test]
fn test_snapshot_file_hash_matches_mirror_content() {
    let fixture = fixture();
    let mut snapshotter = snapshotter(&fixture);
    create_4foobar(&fixture.src);
    snapshotter.snapshot(&ProgressHandle::new()).unwrap();

    for file in snapshotter.get_snapshot_state().files {
        let path = fixture.dst.join(&file.relative_path);
        if file.hexdigest.is_empty() {
            let content = base64::decode(file.content_b64.as_ref().unwrap()).unwrap();
            assert_eq!(fs::read(&path).unwrap(), content);
        } else {
            assert_eq!(
                astacus::tools::hash_hexdigest_file(&path).unwrap(),
                file.hexdigest
            );
        }
    }
}

#[test]
fn test_upload_reports_missing_hexdigest() {
    let fixture = fixture();
    let mut snapshotter = snapshotter(&fixture);
    create_4foobar(&fixture.src);
    snapshotter.snapshot(&ProgressHandle::new()).unwrap();

    let uploader = Uploader {
        storage_config: storage_config(&fixture),
        parallel: 1,
    };
    let progress = ProgressHandle::new();
    uploader
        .write_hashes_to_storage(
            &snapshotter,
            &["0123456789abcdef".to_string()],
            &progress,
            || true,
        )
        .unwrap();
    let progress = progress.get();
    assert!(progress.finished_failed());
    assert_eq!(progress.failed, 1);
}

#[test]
fn test_upload_detects_mutation_before_upload() {
    let fixture = fixture();
    let mut snapshotter = snapshotter(&fixture);
    create_4foobar(&fixture.src);
    snapshotter.snapshot(&ProgressHandle::new()).unwrap();
    let hashes = snapshotter.get_snapshot_hashes();

    // mutate both holders of the digest behind the snapshotter's back;
    // hard links make the mirror see it immediately
    fs::write(fixture.src.join("foobig"), "x".repeat(600)).unwrap();
    fs::write(fixture.src.join("foobig2"), "x".repeat(600)).unwrap();

    let uploader = Uploader {
        storage_config: storage_config(&fixture),
        parallel: 1,
    };
    let progress = ProgressHandle::new();
    let hexdigests: Vec<String> = hashes.iter().map(|hash| hash.hexdigest.clone()).collect();
    uploader
        .write_hashes_to_storage(&snapshotter, &hexdigests, &progress, || true)
        .unwrap();
    // no candidate had stable bytes; nothing may be left in the store
    assert!(progress.get().finished_failed());
    let storage = ObjectStorage::open(&storage_config(&fixture)).unwrap();
    assert!(storage.list_hexdigests().unwrap().is_empty());
}
