//! Download (restore) operation: materialize a manifest's snapshot state
//! into the local data directory.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};
use log::{info, warn};

use crate::common::ipc::{BackupManifest, NodeResult, SnapshotDownloadRequest, SnapshotFile, SnapshotState};
use crate::common::objectstorage::{ObjectStorage, ObjectStorageConfig};
use crate::common::op::{OpHandle, StartResult};
use crate::common::progress::ProgressHandle;
use crate::common::storage::JsonStorage;
use crate::node::snapshotter::Snapshotter;
use crate::node::{with_worker_storage, Node};
use crate::tools;
use crate::tools::parallel_handler::ParallelHandler;

pub fn start_download_op(
    node: &Arc<Node>,
    req: SnapshotDownloadRequest,
    request_url: &str,
) -> Result<StartResult, Error> {
    let snapshotter = node.get_or_create_snapshotter(&req.root_globs)?;
    let result = Arc::new(Mutex::new(NodeResult {
        hostname: node.hostname().to_string(),
        ..Default::default()
    }));
    let progress = ProgressHandle::new();

    let downloader = Downloader {
        dst: node.config.root.clone(),
        storage_config: node.storage_config.clone(),
        parallel: node.config.parallel.downloads,
    };

    let fun = {
        let progress = progress.clone();
        move |handle: OpHandle| {
            let storage = ObjectStorage::open(&downloader.storage_config)?;
            let manifest: BackupManifest =
                serde_json::from_value(storage.download_json(&req.backup_name)?)?;
            let snapshotstate = manifest
                .snapshot_results
                .get(req.snapshot_index)
                .and_then(|result| result.state.clone())
                .ok_or_else(|| {
                    format_err!(
                        "manifest {:?} has no snapshot state for node index {}",
                        req.backup_name,
                        req.snapshot_index
                    )
                })?;

            // the snapshotter is shared; make sure we have sole access
            let mut snapshotter = snapshotter.lock().unwrap();
            handle.check_op_id()?;
            let still_running = {
                let handle = handle.clone();
                move || handle.is_current()
            };
            downloader.download_from_storage(
                &mut snapshotter,
                &snapshotstate,
                &progress,
                still_running,
            )
        }
    };

    Ok(node.start_op("download", request_url, result, progress, fun))
}

pub struct Downloader {
    pub dst: PathBuf,
    pub storage_config: ObjectStorageConfig,
    pub parallel: usize,
}

/// One digest's worth of work for the download pool: the first file is
/// fetched from the object store, the rest are local copies of it.
struct DownloadGroup {
    hexdigest: String,
    files: Vec<SnapshotFile>,
    already_present: Vec<bool>,
}

impl Downloader {
    pub fn download_from_storage(
        &self,
        snapshotter: &mut Snapshotter,
        snapshotstate: &SnapshotState,
        progress: &ProgressHandle,
        still_running: impl Fn() -> bool + Send + Sync + Clone + 'static,
    ) -> Result<(), Error> {
        let mut hexdigest_to_snapshotfiles: Vec<(String, Vec<SnapshotFile>)> = Vec::new();
        let mut hexdigest_index: HashMap<String, usize> = HashMap::new();
        let mut valid_relative_paths: HashSet<String> = HashSet::new();
        for snapshotfile in &snapshotstate.files {
            valid_relative_paths.insert(snapshotfile.relative_path.clone());
            if !snapshotfile.hexdigest.is_empty() {
                let index = *hexdigest_index
                    .entry(snapshotfile.hexdigest.clone())
                    .or_insert_with(|| {
                        hexdigest_to_snapshotfiles
                            .push((snapshotfile.hexdigest.clone(), Vec::new()));
                        hexdigest_to_snapshotfiles.len() - 1
                    });
                hexdigest_to_snapshotfiles[index].1.push(snapshotfile.clone());
            }
        }

        // refresh the index so the already-present checks below see the
        // current on-disk state
        snapshotter.snapshot(&ProgressHandle::new())?;

        progress.start(
            snapshotstate
                .files
                .iter()
                .map(|file| 1 + file.file_size)
                .sum(),
        );

        // inline payloads are written directly; they have no blob
        for snapshotfile in &snapshotstate.files {
            if snapshotfile.hexdigest.is_empty() {
                if !self.snapshotfile_already_exists(snapshotter, snapshotfile) {
                    self.write_inline_snapshotfile(snapshotfile)?;
                }
                progress.download_success(snapshotfile.file_size + 1);
            }
        }

        // largest content first keeps the pool busy with even work
        let mut groups: Vec<DownloadGroup> = hexdigest_to_snapshotfiles
            .into_iter()
            .map(|(hexdigest, files)| {
                let already_present = files
                    .iter()
                    .map(|file| self.snapshotfile_already_exists(snapshotter, file))
                    .collect();
                DownloadGroup {
                    hexdigest,
                    files,
                    already_present,
                }
            })
            .collect();
        groups.sort_by_key(|group| std::cmp::Reverse(group.files[0].file_size));

        let dst = self.dst.clone();
        let storage_config = self.storage_config.clone();
        let worker_progress = progress.clone();
        let worker_still_running = still_running.clone();

        let pool = ParallelHandler::new(
            "download worker",
            self.parallel,
            move |group: DownloadGroup| {
                if !worker_still_running() {
                    anyhow::bail!("operation is no longer running");
                }
                download_group(&storage_config, &dst, &group)?;
                let first_size = group.files[0].file_size;
                worker_progress.download_success((first_size + 1) * group.files.len() as u64);
                Ok(())
            },
        );

        let mut send_result = Ok(());
        for group in groups {
            if let Err(err) = pool.send(group) {
                send_result = Err(err);
                break;
            }
        }
        let complete_result = pool.complete().and(send_result);

        if let Err(err) = complete_result {
            if !still_running() {
                info!("download interrupted: {}", err);
                progress.add_fail(1);
                progress.done();
                return Ok(());
            }
            return Err(err);
        }

        // delete files that are not supposed to exist
        for relative_path in snapshotter.snapshotfiles().keys() {
            if !valid_relative_paths.contains(relative_path) {
                let path = self.dst.join(relative_path);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!("unable to remove extra file {:?}: {}", path, err),
                }
            }
        }

        progress.done();
        Ok(())
    }

    fn snapshotfile_already_exists(
        &self,
        snapshotter: &Snapshotter,
        snapshotfile: &SnapshotFile,
    ) -> bool {
        snapshotter
            .snapshotfiles()
            .get(&snapshotfile.relative_path)
            .map(|existing| existing.equals_excluding_mtime(snapshotfile))
            .unwrap_or(false)
    }

    fn write_inline_snapshotfile(&self, snapshotfile: &SnapshotFile) -> Result<(), Error> {
        let content_b64 = snapshotfile
            .content_b64
            .as_ref()
            .ok_or_else(|| {
                format_err!(
                    "{} has neither hexdigest nor inline content",
                    snapshotfile.relative_path
                )
            })?;
        let path = self.dst.join(&snapshotfile.relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, base64::decode(content_b64)?)?;
        tools::set_file_mtime_ns(&path, snapshotfile.mtime_ns)?;
        Ok(())
    }
}

fn download_group(
    storage_config: &ObjectStorageConfig,
    dst: &Path,
    group: &DownloadGroup,
) -> Result<(), Error> {
    let first = &group.files[0];
    let first_path = dst.join(&first.relative_path);
    if !group.already_present[0] {
        if let Some(parent) = first_path.parent() {
            fs::create_dir_all(parent)?;
        }
        with_worker_storage(storage_config, |storage| {
            use crate::common::storage::HexDigestStorage;
            storage.download_hexdigest_to_path(&group.hexdigest, &first_path)
        })?;
        tools::set_file_mtime_ns(&first_path, first.mtime_ns)?;
    }

    // remaining files with the same digest are local copies, which is
    // close enough to instant to not report per-file progress
    for (snapshotfile, already_present) in
        group.files.iter().zip(&group.already_present).skip(1)
    {
        if *already_present {
            continue;
        }
        let path = dst.join(&snapshotfile.relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&first_path, &path)?;
        tools::set_file_mtime_ns(&path, snapshotfile.mtime_ns)?;
    }
    Ok(())
}
