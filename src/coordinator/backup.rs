//! Backup operation: snapshot on all nodes, deduplicate, upload, persist
//! the manifest.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Error;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use http::Method;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::common::ipc::{
    manifest_name, BackupManifest, NodeResult, SnapshotHash, SnapshotRequest, SnapshotResult,
    SnapshotUploadRequest,
};
use crate::coordinator::plugins::{BackupStep, PluginSpec};
use crate::coordinator::{Coordinator, CoordinatorOp, LockedOp};

/// Planner output for one node: the blobs it has to upload this round
/// and the running size used for load balancing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIndexData {
    pub node_index: usize,
    pub sshashes: Vec<SnapshotHash>,
    pub total_size: u64,
}

impl NodeIndexData {
    fn append_sshash(&mut self, sshash: SnapshotHash) {
        self.total_size += sshash.size;
        self.sshashes.push(sshash);
    }
}

/// Partition the not-yet-stored blobs over their holders.
///
/// Rarest blobs are assigned first so a node that is the only holder of
/// several large unique blobs is not starved; within a rarity tier,
/// larger blobs go first so later small ones can fill the gaps. Each
/// blob goes to its least-loaded holder, ties broken by node index so
/// the assignment is deterministic.
pub fn snapshot_results_to_upload_node_index_datas(
    snapshot_results: &[SnapshotResult],
    stored_hexdigests: &BTreeSet<String>,
) -> Vec<NodeIndexData> {
    let mut sshash_order: Vec<SnapshotHash> = Vec::new();
    let mut sshash_to_node_indexes: HashMap<SnapshotHash, Vec<usize>> = HashMap::new();
    for (node_index, snapshot_result) in snapshot_results.iter().enumerate() {
        for sshash in &snapshot_result.hashes {
            if !sshash_to_node_indexes.contains_key(sshash) {
                sshash_order.push(sshash.clone());
            }
            sshash_to_node_indexes
                .entry(sshash.clone())
                .or_default()
                .push(node_index);
        }
    }

    // stable sort keeps first-seen order within equal (holders, size)
    sshash_order.sort_by_key(|sshash| {
        let holders = sshash_to_node_indexes[sshash].len();
        (holders, std::cmp::Reverse(sshash.size))
    });

    let mut node_index_datas: Vec<NodeIndexData> = (0..snapshot_results.len())
        .map(|node_index| NodeIndexData {
            node_index,
            ..Default::default()
        })
        .collect();

    for sshash in sshash_order {
        if stored_hexdigests.contains(&sshash.hexdigest) {
            continue;
        }
        let holders = &sshash_to_node_indexes[&sshash];
        let node_index = holders
            .iter()
            .copied()
            .min_by_key(|node_index| (node_index_datas[*node_index].total_size, *node_index))
            .expect("blob without holder");
        node_index_datas[node_index].append_sshash(sshash);
    }

    node_index_datas
        .into_iter()
        .filter(|data| !data.sshashes.is_empty())
        .collect()
}

/// Step results shared down the backup pipeline (and with plugin hooks).
#[derive(Default)]
pub struct BackupContext {
    pub attempt: u32,
    pub attempt_start: Option<DateTime<Utc>>,
    pub snapshot_results: Vec<SnapshotResult>,
    pub stored_hexdigests: BTreeSet<String>,
    pub upload_results: Vec<NodeResult>,
    /// Opaque payload the plugin wants persisted in the manifest.
    pub plugin_data: serde_json::Value,
}

pub struct BackupOp {
    op: Arc<CoordinatorOp>,
    json_storage: crate::common::asyncstorage::AsyncJsonStorage,
    hex_storage: crate::common::asyncstorage::AsyncHexDigestStorage,
    plugin: PluginSpec,
    pub context: BackupContext,
}

impl BackupOp {
    pub fn new(coordinator: &Coordinator, op: Arc<CoordinatorOp>, plugin: PluginSpec) -> Self {
        Self {
            op,
            json_storage: coordinator.json_storage.clone(),
            hex_storage: coordinator.hex_storage.clone(),
            plugin,
            context: BackupContext::default(),
        }
    }

    async fn run_step(&mut self, step: &BackupStep) -> Result<bool, Error> {
        debug!("backup step {:?}", step);
        match step {
            BackupStep::Snapshot => self.step_snapshot().await,
            BackupStep::ListHexdigests => self.step_list_hexdigests().await,
            BackupStep::UploadBlocks => self.step_upload_blocks().await,
            BackupStep::UploadManifest => self.step_upload_manifest().await,
            BackupStep::Hook(name) => match &self.plugin.hooks {
                Some(hooks) => hooks.clone().run_backup_hook(name, &mut self.context),
                None => {
                    anyhow::bail!("plugin {:?} has no hook {:?}", self.plugin.name, name)
                }
            },
        }
    }

    async fn step_snapshot(&mut self) -> Result<bool, Error> {
        let request = serde_json::to_value(SnapshotRequest {
            root_globs: self.op.config.root_globs.clone(),
        })?;
        let start_results = self
            .op
            .request_from_nodes("snapshot", Method::POST, Some(&request), None)
            .await;
        if start_results.is_empty() {
            return Ok(false);
        }
        let results: Vec<SnapshotResult> = self
            .op
            .wait_successful_results(&start_results, &self.op.nodes)
            .await;
        if results.is_empty() {
            info!("unable to snapshot successfully");
            return Ok(false);
        }
        self.context.snapshot_results = results;
        Ok(true)
    }

    async fn step_list_hexdigests(&mut self) -> Result<bool, Error> {
        let stored = self.hex_storage.list_hexdigests().await?;
        self.context.stored_hexdigests = stored.into_iter().collect();
        Ok(true)
    }

    async fn step_upload_blocks(&mut self) -> Result<bool, Error> {
        let node_index_datas = snapshot_results_to_upload_node_index_datas(
            &self.context.snapshot_results,
            &self.context.stored_hexdigests,
        );
        if node_index_datas.is_empty() {
            // everything is deduplicated away
            return Ok(true);
        }

        let mut start_results = Vec::new();
        let mut selected_nodes = Vec::new();
        for data in &node_index_datas {
            let node = self.op.nodes[data.node_index].clone();
            let request = serde_json::to_value(SnapshotUploadRequest {
                hashes: data.sshashes.clone(),
            })?;
            let start_result = self
                .op
                .request_from_nodes(
                    "upload",
                    Method::POST,
                    Some(&request),
                    Some(std::slice::from_ref(&node)),
                )
                .await;
            if start_result.len() != 1 {
                return Ok(false);
            }
            start_results.extend(start_result);
            selected_nodes.push(node);
        }

        let results: Vec<NodeResult> = self
            .op
            .wait_successful_results(&start_results, &selected_nodes)
            .await;
        if results.is_empty() {
            info!("unable to upload successfully");
            return Ok(false);
        }
        self.context.upload_results = results;
        Ok(true)
    }

    async fn step_upload_manifest(&mut self) -> Result<bool, Error> {
        let attempt_start = self
            .context
            .attempt_start
            .expect("attempt start set by run_attempts");
        let manifest = BackupManifest {
            attempt: self.context.attempt,
            start: attempt_start,
            snapshot_results: self.context.snapshot_results.clone(),
            plugin: self.plugin.name.clone(),
            plugin_data: self.context.plugin_data.clone(),
        };
        let name = manifest_name(&attempt_start);
        debug!("storing backup manifest {}", name);
        self.json_storage
            .upload_json(&name, &serde_json::to_value(&manifest)?)
            .await?;
        Ok(true)
    }
}

impl LockedOp for BackupOp {
    fn op(&self) -> Arc<CoordinatorOp> {
        self.op.clone()
    }

    fn attempts(&self) -> u32 {
        self.op.config.backup_attempts
    }

    fn begin_attempt(&mut self, attempt: u32, attempt_start: DateTime<Utc>) {
        self.context = BackupContext {
            attempt,
            attempt_start: Some(attempt_start),
            ..Default::default()
        };
    }

    fn try_run<'a>(&'a mut self) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            for step in self.plugin.backup_steps.clone() {
                self.op.handle.check_op_id()?;
                if !self.run_step(&step).await? {
                    info!("backup step {:?} failed", step);
                    return Ok(false);
                }
            }
            Ok(true)
        }
        .boxed()
    }
}
