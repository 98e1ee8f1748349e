//! Wire types shared between the coordinator and the nodes.
//!
//! These are part of the HTTP contract; field names and the lexicographic
//! ordering of [`SnapshotState::files`] must stay stable because backup
//! manifests persist them verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::progress::Progress;

/// One source file captured by a snapshot.
///
/// `hexdigest` stays empty until the file has been hashed, and remains
/// empty forever for files small enough to be embedded inline as
/// `content_b64` instead of being stored as a blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub relative_path: String,
    pub mtime_ns: i64,
    pub file_size: u64,
    #[serde(default)]
    pub hexdigest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_b64: Option<String>,
}

impl SnapshotFile {
    /// Content equality; mtime is irrelevant when deciding whether a file
    /// on disk already matches what a manifest wants there.
    pub fn equals_excluding_mtime(&self, other: &SnapshotFile) -> bool {
        self.relative_path == other.relative_path
            && self.file_size == other.file_size
            && self.hexdigest == other.hexdigest
            && self.content_b64 == other.content_b64
    }
}

/// Identity and billing unit of one content blob.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotHash {
    pub hexdigest: String,
    pub size: u64,
}

/// Ordered sequence of files of one node at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    #[serde(default)]
    pub files: Vec<SnapshotFile>,
}

/// Generic per-node outcome of an operation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeResult {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub progress: Progress,
}

/// Per-node outcome of a snapshot operation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotResult {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Full file list; embedded in the backup manifest and replayed on
    /// restore.
    #[serde(default)]
    pub state: Option<SnapshotState>,
    /// Unique (hexdigest, size) set of the snapshot.
    #[serde(default)]
    pub hashes: Vec<SnapshotHash>,
    #[serde(default)]
    pub files: u64,
    #[serde(default)]
    pub total_size: u64,
}

/// Accessor used by the coordinator's generic result poller.
pub trait OpResult: serde::de::DeserializeOwned {
    fn progress(&self) -> &Progress;
}

impl OpResult for NodeResult {
    fn progress(&self) -> &Progress {
        &self.progress
    }
}

impl OpResult for SnapshotResult {
    fn progress(&self) -> &Progress {
        &self.progress
    }
}

/// Global result of one backup attempt, persisted as JSON under
/// `backup-<iso8601 attempt start>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupManifest {
    pub attempt: u32,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub snapshot_results: Vec<SnapshotResult>,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub plugin_data: serde_json::Value,
}

pub const BACKUP_MANIFEST_PREFIX: &str = "backup-";

pub fn manifest_name(start: &DateTime<Utc>) -> String {
    format!("{}{}", BACKUP_MANIFEST_PREFIX, start.to_rfc3339())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub root_globs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotUploadRequest {
    pub hashes: Vec<SnapshotHash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotDownloadRequest {
    pub backup_name: String,
    /// Index of this node in the manifest's snapshot result list.
    pub snapshot_index: usize,
    pub root_globs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotClearRequest {
    pub root_globs: Vec<String>,
}
