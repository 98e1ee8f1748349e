//! Snapshot and upload operations.

use std::sync::{Arc, Mutex};

use anyhow::Error;
use chrono::Utc;
use log::{info, warn};

use crate::common::ipc::{
    NodeResult, SnapshotFile, SnapshotRequest, SnapshotResult, SnapshotUploadRequest,
};
use crate::common::op::{OpHandle, StartResult};
use crate::common::progress::ProgressHandle;
use crate::common::storage::HexDigestStorage;
use crate::node::{with_worker_storage, Node};
use crate::tools;
use crate::tools::parallel_handler::ParallelHandler;

/// Fan a snapshot out to the blocking pool and fill in the result.
pub fn start_snapshot_op(
    node: &Arc<Node>,
    req: SnapshotRequest,
    request_url: &str,
) -> Result<StartResult, Error> {
    let snapshotter = node.get_or_create_snapshotter(&req.root_globs)?;
    let result = Arc::new(Mutex::new(SnapshotResult {
        hostname: node.hostname().to_string(),
        start: Some(Utc::now()),
        ..Default::default()
    }));
    let progress = ProgressHandle::new();

    let fun = {
        let result = result.clone();
        let progress = progress.clone();
        move |handle: OpHandle| {
            let mut snapshotter = snapshotter.lock().unwrap();
            handle.check_op_id()?;
            let changes = snapshotter.snapshot(&progress)?;
            info!("snapshot done, {} changes", changes);
            let state = snapshotter.get_snapshot_state();
            let mut result = result.lock().unwrap();
            result.files = state.files.len() as u64;
            result.total_size = state.files.iter().map(|file| file.file_size).sum();
            result.hashes = snapshotter.get_snapshot_hashes();
            result.state = Some(state);
            result.end = Some(Utc::now());
            Ok(())
        }
    };

    Ok(node.start_op("snapshot", request_url, result, progress, fun))
}

/// Upload the requested hexdigests to the object store.
pub fn start_upload_op(
    node: &Arc<Node>,
    req: SnapshotUploadRequest,
    request_url: &str,
) -> Result<StartResult, Error> {
    let snapshotter = node
        .current_snapshotter()
        .ok_or_else(|| anyhow::format_err!("no snapshot exists on this node"))?;
    let result = Arc::new(Mutex::new(NodeResult {
        hostname: node.hostname().to_string(),
        ..Default::default()
    }));
    let progress = ProgressHandle::new();

    let uploader = Uploader {
        storage_config: node.storage_config.clone(),
        parallel: node.config.parallel.uploads,
    };

    let fun = {
        let progress = progress.clone();
        move |handle: OpHandle| {
            let snapshotter = snapshotter.lock().unwrap();
            handle.check_op_id()?;
            let hexdigests: Vec<String> =
                req.hashes.iter().map(|hash| hash.hexdigest.clone()).collect();
            let still_running = {
                let handle = handle.clone();
                move || handle.is_current()
            };
            uploader.write_hashes_to_storage(&snapshotter, &hexdigests, &progress, still_running)
        }
    };

    Ok(node.start_op("upload", request_url, result, progress, fun))
}

pub struct Uploader {
    pub storage_config: crate::common::objectstorage::ObjectStorageConfig,
    pub parallel: usize,
}

enum UploadOutcome {
    Success,
    Failure,
    Missing,
}

impl Uploader {
    /// Upload every requested digest exactly once.
    ///
    /// The snapshot-to-upload gap is non-atomic, so each candidate file
    /// is re-hashed before the upload, and once more after it: a file
    /// that mutated underneath has its just-uploaded blob deleted again
    /// rather than letting a digest point at drifted bytes.
    pub fn write_hashes_to_storage(
        &self,
        snapshotter: &crate::node::snapshotter::Snapshotter,
        hexdigests: &[String],
        progress: &ProgressHandle,
        still_running: impl Fn() -> bool + Send + Sync + Clone + 'static,
    ) -> Result<(), Error> {
        let todo: std::collections::BTreeSet<String> = hexdigests.iter().cloned().collect();
        progress.start(todo.len() as u64);

        let dst = snapshotter.dst().to_path_buf();
        let storage_config = self.storage_config.clone();
        let worker_progress = progress.clone();

        let pool = ParallelHandler::new(
            "upload worker",
            self.parallel,
            move |(hexdigest, files): (String, Vec<SnapshotFile>)| {
                if !still_running() {
                    // leave the digest unhandled; the progress never
                    // completes and the op ends up failed
                    return Ok(());
                }
                let outcome =
                    upload_one_hexdigest(&storage_config, &dst, &hexdigest, &files)?;
                match outcome {
                    UploadOutcome::Success => worker_progress.upload_success(&hexdigest),
                    UploadOutcome::Failure => worker_progress.upload_failure(&hexdigest),
                    UploadOutcome::Missing => worker_progress.upload_missing(&hexdigest),
                }
                Ok(())
            },
        );

        let mut send_result = Ok(());
        for hexdigest in todo {
            let files = snapshotter.snapshotfiles_for_hexdigest(&hexdigest).to_vec();
            if let Err(err) = pool.send((hexdigest, files)) {
                send_result = Err(err);
                break;
            }
        }
        let complete_result = pool.complete();

        progress.done();
        send_result?;
        complete_result
    }
}

fn upload_one_hexdigest(
    storage_config: &crate::common::objectstorage::ObjectStorageConfig,
    dst: &std::path::Path,
    hexdigest: &str,
    files: &[SnapshotFile],
) -> Result<UploadOutcome, Error> {
    let mut saw_drift = false;
    for snapshotfile in files {
        let path = dst.join(&snapshotfile.relative_path);
        if !path.is_file() {
            warn!("{:?} disappeared post-snapshot", path);
            continue;
        }
        let current = tools::hash_hexdigest_file(&path)?;
        if current != snapshotfile.hexdigest {
            info!("hash of {} changed before upload", snapshotfile.relative_path);
            continue;
        }
        let uploaded = with_worker_storage(storage_config, |storage| {
            storage.upload_hexdigest_from_path(hexdigest, &path)
        })?;
        if !uploaded {
            // one file with this digest was enough; a failed send does
            // not make us try the other candidates
            return Ok(UploadOutcome::Failure);
        }
        let current = tools::hash_hexdigest_file(&path)?;
        if current != snapshotfile.hexdigest {
            info!("hash of {} changed after upload", snapshotfile.relative_path);
            with_worker_storage(storage_config, |storage| {
                storage.delete_hexdigest(hexdigest)
            })?;
            // another candidate with the same digest may still have
            // stable bytes
            saw_drift = true;
            continue;
        }
        return Ok(UploadOutcome::Success);
    }
    if saw_drift {
        // every stable-looking candidate drifted during its upload
        Ok(UploadOutcome::Failure)
    } else {
        Ok(UploadOutcome::Missing)
    }
}
