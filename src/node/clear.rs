//! Clear operation, for operators who want a clean slate before a
//! restore.
//!
//! Removes every file the snapshotter indexes from both the live data
//! directory and its mirror. Restore writes into the live directory, so
//! a mirror-only wipe would leave the old data in place; only files
//! matching the request's globs are touched.

use std::fs;
use std::sync::{Arc, Mutex};

use anyhow::Error;
use log::warn;

use crate::common::ipc::{NodeResult, SnapshotClearRequest};
use crate::common::op::{OpHandle, StartResult};
use crate::common::progress::ProgressHandle;
use crate::node::Node;

pub fn start_clear_op(
    node: &Arc<Node>,
    req: SnapshotClearRequest,
    request_url: &str,
) -> Result<StartResult, Error> {
    let snapshotter = node.get_or_create_snapshotter(&req.root_globs)?;
    let result = Arc::new(Mutex::new(NodeResult {
        hostname: node.hostname().to_string(),
        ..Default::default()
    }));
    let progress = ProgressHandle::new();
    let root = node.config.root.clone();

    let fun = {
        let progress = progress.clone();
        move |handle: OpHandle| {
            let mut snapshotter = snapshotter.lock().unwrap();
            handle.check_op_id()?;
            // refresh first so the wipe covers the current state
            snapshotter.snapshot(&ProgressHandle::new())?;

            let files: Vec<String> = snapshotter.snapshotfiles().keys().cloned().collect();
            progress.start(files.len() as u64);
            let mirror = snapshotter.dst().to_path_buf();
            for relative_path in files {
                handle.check_op_id()?;
                let mut failed = false;
                for base in [&root, &mirror].iter() {
                    let path = base.join(&relative_path);
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => {
                            warn!("unable to remove {:?}: {}", path, err);
                            failed = true;
                        }
                    }
                }
                if failed {
                    progress.add_fail(1);
                } else {
                    progress.add_success(1);
                }
            }
            // files are gone from source and mirror alike, which the
            // incremental pass cannot see; start the index over
            snapshotter.reset();
            snapshotter.snapshot(&ProgressHandle::new())?;
            progress.done();
            Ok(())
        }
    };

    Ok(node.start_op("clear", request_url, result, progress, fun))
}
