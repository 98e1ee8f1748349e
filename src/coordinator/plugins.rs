//! Plugin surface.
//!
//! A plugin is a named step sequence, not a subclass: the registry maps
//! a plugin id to the backup and restore steps it wants, and products
//! with extra needs (say, dumping an external key-value store before the
//! snapshot and checking it did not move afterwards) contribute hook
//! steps that run between the built-in ones. The plugin also owns the
//! opaque payload stored in every backup manifest.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Error};

use crate::coordinator::backup::BackupContext;
use crate::coordinator::restore::RestoreContext;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupStep {
    Snapshot,
    ListHexdigests,
    UploadBlocks,
    UploadManifest,
    /// Plugin-defined step, dispatched to the plugin's hooks by name.
    Hook(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreStep {
    BackupName,
    BackupManifest,
    Restore,
    Hook(String),
}

/// Hook implementations for the `Hook` steps of one plugin.
///
/// Hooks run on the coordinator's cooperative loop; implementations do
/// their own offloading if they block. Returning `Ok(false)` aborts the
/// attempt the same way a failed built-in step does.
pub trait PluginHooks: Send + Sync {
    fn run_backup_hook(&self, name: &str, context: &mut BackupContext) -> Result<bool, Error>;
    fn run_restore_hook(&self, name: &str, context: &mut RestoreContext) -> Result<bool, Error>;
}

#[derive(Clone)]
pub struct PluginSpec {
    pub name: String,
    pub backup_steps: Vec<BackupStep>,
    pub restore_steps: Vec<RestoreStep>,
    pub hooks: Option<Arc<dyn PluginHooks>>,
}

/// Plugin registry. `files` is built in; products register their own
/// specs on top.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, PluginSpec>,
}

impl PluginRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register(files_plugin());
        registry
    }

    pub fn register(&mut self, spec: PluginSpec) {
        self.plugins.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Result<PluginSpec, Error> {
        match self.plugins.get(name) {
            Some(spec) => Ok(spec.clone()),
            None => bail!("unknown plugin {:?}", name),
        }
    }
}

/// The basic file backup: snapshot everything the globs cover, upload
/// what the object store does not already have, persist the manifest.
pub fn files_plugin() -> PluginSpec {
    PluginSpec {
        name: "files".to_string(),
        backup_steps: vec![
            BackupStep::Snapshot,
            BackupStep::ListHexdigests,
            BackupStep::UploadBlocks,
            BackupStep::UploadManifest,
        ],
        restore_steps: vec![
            RestoreStep::BackupName,
            RestoreStep::BackupManifest,
            RestoreStep::Restore,
        ],
        hooks: None,
    }
}
