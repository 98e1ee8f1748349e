//! Restore operation: pick a manifest, hand every node its snapshot
//! state, wait for the downloads.

use std::sync::Arc;

use anyhow::Error;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use http::Method;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::common::ipc::{
    BackupManifest, NodeResult, SnapshotDownloadRequest, BACKUP_MANIFEST_PREFIX,
};
use crate::coordinator::plugins::{PluginSpec, RestoreStep};
use crate::coordinator::{Coordinator, CoordinatorOp, LockedOp};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Explicit manifest name; the most recent backup when unset.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Default)]
pub struct RestoreContext {
    pub attempt: u32,
    pub attempt_start: Option<DateTime<Utc>>,
    pub backup_name: Option<String>,
    pub manifest: Option<BackupManifest>,
}

pub struct RestoreOp {
    op: Arc<CoordinatorOp>,
    json_storage: crate::common::asyncstorage::AsyncJsonStorage,
    plugin: PluginSpec,
    request: RestoreRequest,
    pub context: RestoreContext,
}

impl RestoreOp {
    pub fn new(
        coordinator: &Coordinator,
        op: Arc<CoordinatorOp>,
        plugin: PluginSpec,
        request: RestoreRequest,
    ) -> Self {
        Self {
            op,
            json_storage: coordinator.json_storage.clone(),
            plugin,
            request,
            context: RestoreContext::default(),
        }
    }

    async fn run_step(&mut self, step: &RestoreStep) -> Result<bool, Error> {
        debug!("restore step {:?}", step);
        match step {
            RestoreStep::BackupName => self.step_backup_name().await,
            RestoreStep::BackupManifest => self.step_backup_manifest().await,
            RestoreStep::Restore => self.step_restore().await,
            RestoreStep::Hook(name) => match &self.plugin.hooks {
                Some(hooks) => hooks.clone().run_restore_hook(name, &mut self.context),
                None => {
                    anyhow::bail!("plugin {:?} has no hook {:?}", self.plugin.name, name)
                }
            },
        }
    }

    async fn step_backup_name(&mut self) -> Result<bool, Error> {
        if let Some(name) = &self.request.name {
            self.context.backup_name = Some(name.clone());
            return Ok(true);
        }
        // ISO-8601 order is time order, so max() is the most recent
        let latest = self
            .json_storage
            .list_jsons()
            .await?
            .into_iter()
            .filter(|name| name.starts_with(BACKUP_MANIFEST_PREFIX))
            .max();
        match latest {
            Some(name) => {
                self.context.backup_name = Some(name);
                Ok(true)
            }
            None => {
                info!("no backups exist");
                Ok(false)
            }
        }
    }

    async fn step_backup_manifest(&mut self) -> Result<bool, Error> {
        let name = self
            .context
            .backup_name
            .clone()
            .expect("backup_name step ran first");
        let manifest: BackupManifest =
            serde_json::from_value(self.json_storage.download_json(&name).await?)?;
        self.context.manifest = Some(manifest);
        Ok(true)
    }

    async fn step_restore(&mut self) -> Result<bool, Error> {
        let backup_name = self
            .context
            .backup_name
            .clone()
            .expect("backup_name step ran first");
        let manifest = self
            .context
            .manifest
            .as_ref()
            .expect("backup_manifest step ran first");
        if manifest.snapshot_results.len() != self.op.nodes.len() {
            info!(
                "manifest has {} node results but the cluster has {} nodes",
                manifest.snapshot_results.len(),
                self.op.nodes.len()
            );
            return Ok(false);
        }

        let mut start_results = Vec::new();
        for (snapshot_index, node) in self.op.nodes.iter().enumerate() {
            let request = serde_json::to_value(SnapshotDownloadRequest {
                backup_name: backup_name.clone(),
                snapshot_index,
                root_globs: self.op.config.root_globs.clone(),
            })?;
            let start_result = self
                .op
                .request_from_nodes(
                    "download",
                    Method::POST,
                    Some(&request),
                    Some(std::slice::from_ref(node)),
                )
                .await;
            if start_result.len() != 1 {
                return Ok(false);
            }
            start_results.extend(start_result);
        }

        let results: Vec<NodeResult> = self
            .op
            .wait_successful_results(&start_results, &self.op.nodes)
            .await;
        if results.is_empty() {
            info!("unable to restore successfully");
            return Ok(false);
        }
        Ok(true)
    }
}

impl LockedOp for RestoreOp {
    fn op(&self) -> Arc<CoordinatorOp> {
        self.op.clone()
    }

    fn attempts(&self) -> u32 {
        self.op.config.restore_attempts
    }

    fn begin_attempt(&mut self, attempt: u32, attempt_start: DateTime<Utc>) {
        self.context = RestoreContext {
            attempt,
            attempt_start: Some(attempt_start),
            ..Default::default()
        };
    }

    fn try_run<'a>(&'a mut self) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            for step in self.plugin.restore_steps.clone() {
                self.op.handle.check_op_id()?;
                if !self.run_step(&step).await? {
                    info!("restore step {:?} failed", step);
                    return Ok(false);
                }
            }
            Ok(true)
        }
        .boxed()
    }
}
